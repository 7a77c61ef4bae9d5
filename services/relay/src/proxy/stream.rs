//! Chunked-stream forwarding.
//!
//! In stream mode the public connection is served as HTTP/1.1. Requests on
//! the tunnel path are re-issued on a fresh backend connection with the same
//! method, path and headers; request and response bodies are streamed, never
//! buffered. Everything else is answered locally.
//!
//! Request heads are held to the same time and size limits as upgrade mode.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::request::{classify, Classification, HeadConfig, RequestHead, RouteConfig};
use super::local::{LocalHandlers, LocalResponse};
use super::relay::RelayEngine;
use crate::config::Mode;
use crate::error::RelayError;
use crate::supervisor::wait_for_shutdown;

/// Smallest read buffer hyper accepts.
const MIN_HTTP_BUF_SIZE: usize = 8192;

/// Response body type shared by relayed and local responses.
pub type StreamBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Everything a stream-mode connection needs to serve requests.
pub struct StreamForwarder {
    engine: Arc<RelayEngine>,
    routes: RouteConfig,
    local: Arc<LocalHandlers>,
    head: HeadConfig,
}

impl StreamForwarder {
    pub fn new(
        engine: Arc<RelayEngine>,
        routes: RouteConfig,
        local: Arc<LocalHandlers>,
        head: HeadConfig,
    ) -> Self {
        Self {
            engine,
            routes,
            local,
            head,
        }
    }

    /// Serve HTTP/1.1 on `io` until the client goes away.
    ///
    /// Each request head must arrive within the head timeout and size limit.
    /// Once `shutdown` flips, the connection finishes its in-flight request
    /// and closes.
    pub async fn serve<S>(
        self: Arc<Self>,
        io: S,
        session_id: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut builder = server_http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.head.timeout)
            .max_buf_size(self.head.max_bytes.max(MIN_HTTP_BUF_SIZE));

        let forwarder = Arc::clone(&self);
        let service = service_fn(move |req| {
            let forwarder = Arc::clone(&forwarder);
            let session_id = session_id.clone();
            async move { Ok::<_, Infallible>(forwarder.handle(req, &session_id).await) }
        });

        let conn = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Shutdown requested, closing stream connection");
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        result.map_err(|e| RelayError::RelayIo(io::Error::other(e)))
    }

    async fn handle(&self, req: Request<Incoming>, session_id: &str) -> Response<StreamBody> {
        let head = RequestHead::from_request(&req);

        match classify(&head, Mode::Stream, &self.routes) {
            Classification::Relay => match self.forward(req).await {
                Ok(response) => {
                    debug!(
                        session = %session_id,
                        method = %head.method,
                        path = %head.path(),
                        status = response.status().as_u16(),
                        "Forwarded request"
                    );
                    response
                }
                Err(e) => {
                    warn!(session = %session_id, error = %e, kind = e.kind(), "Stream forwarding failed");
                    let status = match e {
                        RelayError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                        _ => StatusCode::BAD_GATEWAY,
                    };
                    local_response(LocalResponse::status_only(status))
                }
            },
            Classification::Local(route) => local_response(self.local.respond(route)),
            Classification::Reject(status) => {
                debug!(session = %session_id, status = status.as_u16(), "Request rejected");
                local_response(LocalResponse::status_only(status))
            }
        }
    }

    /// Re-issue `req` on a new backend connection and stream the response back.
    async fn forward(&self, req: Request<Incoming>) -> Result<Response<StreamBody>, RelayError> {
        let backend = self.engine.open_backend().await?;

        let (mut sender, conn) = client_http1::handshake(TokioIo::new(backend))
            .await
            .map_err(|e| RelayError::RelayIo(io::Error::other(e)))?;

        // Ends once the response body is consumed or dropped.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Backend connection closed");
            }
        });

        let (mut parts, body) = req.into_parts();
        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e| RelayError::Handshake(format!("invalid request target: {e}")))?;
        parts.uri = target;

        let response = sender
            .send_request(Request::from_parts(parts, body))
            .await
            .map_err(|e| RelayError::RelayIo(io::Error::other(e)))?;

        Ok(response.map(|body| body.boxed_unsync()))
    }
}

fn local_response(local: LocalResponse) -> Response<StreamBody> {
    let body = Full::new(local.body)
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = local.status;
    if let Ok(value) = http::HeaderValue::from_str(local.content_type) {
        response.headers_mut().insert(http::header::CONTENT_TYPE, value);
    }
    response
}
