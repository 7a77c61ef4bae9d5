//! HTTP request head parsing and classification.
//!
//! The front door only ever looks at the request line and headers:
//! - the head is read with a bounded timeout and size (5s / 16 KiB default)
//! - bytes that arrive after the head are handed back untouched so the relay
//!   can forward them first
//! - classification uses method, path and the upgrade headers only
//!
//! The switching-protocols response is produced here as well; the accept key
//! is derived from the client's `Sec-WebSocket-Key` as RFC 6455 requires.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::config::Mode;
use crate::error::RelayError;

/// Default time allowed for the full request head to arrive.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum request head size.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS: usize = 64;

/// Path answered by the health check.
pub const HEALTH_PATH: &str = "/healthz";

/// Limits applied while reading a request head.
#[derive(Debug, Clone)]
pub struct HeadConfig {
    /// Maximum time to wait for the complete head.
    pub timeout: Duration,
    /// Maximum head size in bytes.
    pub max_bytes: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HEAD_TIMEOUT,
            max_bytes: DEFAULT_MAX_HEAD_BYTES,
        }
    }
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (path plus optional query).
    pub target: String,
    /// HTTP minor version (0 or 1).
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Build a head view from an already parsed request.
    pub fn from_request<B>(req: &http::Request<B>) -> Self {
        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let version = if req.version() == http::Version::HTTP_10 {
            0
        } else {
            1
        };
        let headers = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            method: req.method().as_str().to_string(),
            target,
            version,
            headers,
        }
    }

    /// First value of a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path without the query string.
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(idx) => &self.target[..idx],
            None => &self.target,
        }
    }

    /// Requested upgrade protocol, if `Connection` carries the `upgrade` token.
    pub fn upgrade(&self) -> Option<&str> {
        let upgrade = self.header("upgrade")?.trim();
        let connection = self.header("connection")?;
        let wants_upgrade = connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        (wants_upgrade && !upgrade.is_empty()).then_some(upgrade)
    }

    /// Client WebSocket key, if present.
    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn is_head_request(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Try to parse a request head from `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, or the head plus the
/// number of bytes it occupies.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(header_len)) => {
            let head = RequestHead {
                method: req.method.unwrap_or("GET").to_string(),
                target: req.path.unwrap_or("/").to_string(),
                version: req.version.unwrap_or(1),
                headers: req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
            };
            Ok(Some((head, header_len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RelayError::Handshake(format!("invalid HTTP request: {e}"))),
    }
}

/// Read a request head from `stream`.
///
/// Returns the head and any bytes received after it (the head bytes that
/// must reach the backend before anything else).
pub async fn read_request_head<R: AsyncRead + Unpin>(
    stream: &mut R,
    config: &HeadConfig,
) -> Result<(RequestHead, Vec<u8>), RelayError> {
    match timeout(config.timeout, read_head_inner(stream, config.max_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Handshake(
            "timed out waiting for request head".to_string(),
        )),
    }
}

async fn read_head_inner<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_bytes: usize,
) -> Result<(RequestHead, Vec<u8>), RelayError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::Handshake(
                "connection closed before request head".to_string(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);

        let parsed = parse_request_head(&buffer)?;
        let too_large = match &parsed {
            Some((_, header_len)) => *header_len > max_bytes,
            None => buffer.len() >= max_bytes,
        };
        if too_large {
            return Err(RelayError::Handshake(format!(
                "request head exceeds {max_bytes} bytes"
            )));
        }

        if let Some((head, header_len)) = parsed {
            let rest = buffer.split_off(header_len);
            return Ok((head, rest));
        }
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Paths the front door knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Tunnel entry point. `None` rejects every tunnel attempt.
    pub tunnel_path: Option<String>,
    /// Descriptor path (without leading slash).
    pub sub_path: String,
}

/// Locally served endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRoute {
    /// Status page.
    Status,
    /// Health check.
    Health,
    /// Connection descriptor.
    Descriptor,
    /// Anything else.
    NotFound,
}

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Hand off to the relay engine.
    Relay,
    /// Answer locally, never relay.
    Local(LocalRoute),
    /// Refuse with the given status before touching the backend.
    Reject(StatusCode),
}

/// Decide how to serve a request from its head alone.
pub fn classify(head: &RequestHead, mode: Mode, routes: &RouteConfig) -> Classification {
    let path = head.path();

    match mode {
        Mode::Tcp => Classification::Relay,
        Mode::Upgrade => {
            if head.upgrade().is_some() {
                return match routes.tunnel_path.as_deref() {
                    None => Classification::Reject(StatusCode::BAD_REQUEST),
                    Some(tunnel) if tunnel == path => {
                        if head.method.eq_ignore_ascii_case("GET") {
                            Classification::Relay
                        } else {
                            Classification::Reject(StatusCode::BAD_REQUEST)
                        }
                    }
                    Some(_) => Classification::Reject(StatusCode::NOT_FOUND),
                };
            }
            local_route(head, path, routes)
        }
        Mode::Stream => match routes.tunnel_path.as_deref() {
            Some(tunnel) if is_within(path, tunnel) => Classification::Relay,
            // Only local reads remain when tunneling is disabled.
            None if head.upgrade().is_some() || !is_local_method(head) => {
                Classification::Reject(StatusCode::BAD_REQUEST)
            }
            _ => local_route(head, path, routes),
        },
    }
}

/// `path` equals `prefix` or lies below it.
fn is_within(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

fn is_local_method(head: &RequestHead) -> bool {
    head.method.eq_ignore_ascii_case("GET") || head.is_head_request()
}

fn local_route(head: &RequestHead, path: &str, routes: &RouteConfig) -> Classification {
    if !is_local_method(head) {
        return Classification::Reject(StatusCode::METHOD_NOT_ALLOWED);
    }

    let route = match path {
        "/" => LocalRoute::Status,
        HEALTH_PATH => LocalRoute::Health,
        p if !routes.sub_path.is_empty() && p.strip_prefix('/') == Some(routes.sub_path.as_str()) => {
            LocalRoute::Descriptor
        }
        _ => LocalRoute::NotFound,
    };
    Classification::Local(route)
}

// =============================================================================
// Responses
// =============================================================================

/// Build the `101 Switching Protocols` response for an upgrade request.
pub fn switching_protocols(head: &RequestHead) -> Vec<u8> {
    let upgrade = head.upgrade().unwrap_or("websocket");
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: {upgrade}\r\nConnection: Upgrade\r\n"
    );
    if let Some(key) = head.websocket_key() {
        response.push_str("Sec-WebSocket-Accept: ");
        response.push_str(&derive_accept_key(key.as_bytes()));
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.into_bytes()
}

/// Write a complete `Connection: close` response and flush it.
pub async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: StatusCode,
    content_type: &str,
    body: &Bytes,
    include_body: bool,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    if include_body {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn routes() -> RouteConfig {
        RouteConfig {
            tunnel_path: Some("/speed".to_string()),
            sub_path: "sub".to_string(),
        }
    }

    fn head(raw: &str) -> RequestHead {
        parse_request_head(raw.as_bytes()).unwrap().unwrap().0
    }

    const WS_UPGRADE: &str = "GET /speed HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_parse_partial_head() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: a\r\n")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_invalid_head() {
        let err = parse_request_head(b"\x16\x03\x01\x00\x05hello\r\n\r\n").unwrap_err();
        assert_eq!(err.kind(), "handshake");
    }

    #[test]
    fn test_parse_head_with_query() {
        let head = head("GET /speed?ed=2048 HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(head.path(), "/speed");
        assert_eq!(head.target, "/speed?ed=2048");
        assert_eq!(head.version, 1);
        assert_eq!(head.header("HOST"), Some("a"));
    }

    #[test]
    fn test_upgrade_requires_connection_token() {
        let head = head("GET /speed HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(head.upgrade(), None);
    }

    #[rstest]
    #[case::tunnel_upgrade(WS_UPGRADE, Classification::Relay)]
    #[case::wrong_path_upgrade(
        "GET /other HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        Classification::Reject(StatusCode::NOT_FOUND)
    )]
    #[case::post_upgrade(
        "POST /speed HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        Classification::Reject(StatusCode::BAD_REQUEST)
    )]
    #[case::plain_tunnel_path(
        "GET /speed HTTP/1.1\r\nHost: a\r\n\r\n",
        Classification::Local(LocalRoute::NotFound)
    )]
    #[case::status("GET / HTTP/1.1\r\n\r\n", Classification::Local(LocalRoute::Status))]
    #[case::health("GET /healthz HTTP/1.1\r\n\r\n", Classification::Local(LocalRoute::Health))]
    #[case::descriptor("GET /sub HTTP/1.1\r\n\r\n", Classification::Local(LocalRoute::Descriptor))]
    #[case::head_descriptor("HEAD /sub HTTP/1.1\r\n\r\n", Classification::Local(LocalRoute::Descriptor))]
    #[case::post_local(
        "POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        Classification::Reject(StatusCode::METHOD_NOT_ALLOWED)
    )]
    fn test_classify_upgrade_mode(#[case] raw: &str, #[case] expected: Classification) {
        assert_eq!(classify(&head(raw), Mode::Upgrade, &routes()), expected);
    }

    #[rstest]
    #[case::exact("POST /speed HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n", Classification::Relay)]
    #[case::session_subpath("GET /speed/7f3a/0 HTTP/1.1\r\n\r\n", Classification::Relay)]
    #[case::sibling_path("GET /speedy HTTP/1.1\r\n\r\n", Classification::Local(LocalRoute::NotFound))]
    #[case::status("GET / HTTP/1.1\r\n\r\n", Classification::Local(LocalRoute::Status))]
    fn test_classify_stream_mode(#[case] raw: &str, #[case] expected: Classification) {
        assert_eq!(classify(&head(raw), Mode::Stream, &routes()), expected);
    }

    #[test]
    fn test_missing_tunnel_path_rejects_upgrades() {
        let routes = RouteConfig {
            tunnel_path: None,
            sub_path: "sub".to_string(),
        };
        assert_eq!(
            classify(&head(WS_UPGRADE), Mode::Upgrade, &routes),
            Classification::Reject(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            classify(&head(WS_UPGRADE), Mode::Stream, &routes),
            Classification::Reject(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            classify(&head("GET / HTTP/1.1\r\n\r\n"), Mode::Upgrade, &routes),
            Classification::Local(LocalRoute::Status)
        );
        assert_eq!(
            classify(
                &head("POST /speed HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n"),
                Mode::Stream,
                &routes
            ),
            Classification::Reject(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            classify(&head("GET /healthz HTTP/1.1\r\n\r\n"), Mode::Stream, &routes),
            Classification::Local(LocalRoute::Health)
        );
    }

    #[test]
    fn test_switching_protocols_accept_key() {
        let response = String::from_utf8(switching_protocols(&head(WS_UPGRADE))).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        // Example from RFC 6455 section 1.3.
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_head_returns_trailing_bytes() {
        let mut raw = WS_UPGRADE.as_bytes().to_vec();
        raw.extend_from_slice(b"abc");
        let mut reader = &raw[..];

        let (head, rest) = read_request_head(&mut reader, &HeadConfig::default())
            .await
            .unwrap();
        assert_eq!(head.path(), "/speed");
        assert_eq!(rest, b"abc");
    }

    #[tokio::test]
    async fn test_read_head_limits() {
        let config = HeadConfig {
            timeout: Duration::from_millis(100),
            max_bytes: 32,
        };

        let oversized = format!("GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n", "a".repeat(64));
        let mut reader = oversized.as_bytes();
        let err = read_request_head(&mut reader, &config).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        let (_client, mut server) = tokio::io::duplex(64);
        let err = read_request_head(&mut server, &config).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let mut truncated: &[u8] = b"GET / HTTP/1.1\r\n";
        let err = read_request_head(&mut truncated, &config).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
