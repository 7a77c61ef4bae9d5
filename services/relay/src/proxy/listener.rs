//! Public listener and per-connection handling.
//!
//! The listener owns the public socket. A single accept loop hands every
//! connection to its own task; the loop never waits on session work.
//!
//! - Raw TCP mode relays every connection as is
//! - Upgrade mode reads the request head, then relays or answers locally
//! - Stream mode serves HTTP/1.1 and forwards tunnel-path requests
//!
//! On shutdown the listening socket is closed first, in-flight sessions get
//! a grace period, and whatever is left is aborted (dropping both sockets).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::request::{
    classify, read_request_head, write_response, Classification, HeadConfig, RouteConfig,
};
use super::local::{LocalHandlers, LocalResponse};
use super::relay::{RelayEngine, RelayStats, Session, SessionState};
use super::stream::StreamForwarder;
use crate::config::{Config, Mode};
use crate::error::RelayError;
use crate::supervisor::wait_for_shutdown;

/// Default grace period for in-flight sessions on shutdown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Configuration for the public listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Transport variant.
    pub mode: Mode,
    /// Tunnel and descriptor paths.
    pub routes: RouteConfig,
    /// Request head limits (HTTP modes).
    pub head: HeadConfig,
    /// Maximum concurrent connections (unbounded when `None`).
    pub max_connections: Option<usize>,
    /// Time in-flight sessions get after shutdown.
    pub grace_period: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, mode: Mode, routes: RouteConfig) -> Self {
        Self {
            bind_addr,
            mode,
            routes,
            head: HeadConfig::default(),
            max_connections: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let routes = RouteConfig {
            tunnel_path: config.tunnel_path.clone(),
            sub_path: config.sub_path.clone(),
        };
        Self {
            max_connections: config.max_connections,
            grace_period: config.grace_period,
            ..Self::new(config.bind_addr, config.mode, routes)
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being served.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to the connection cap.
    pub connections_rejected: AtomicU64,
    /// Sessions that reached the relaying state.
    pub sessions_relayed: AtomicU64,
    /// Requests answered locally.
    pub local_responses: AtomicU64,
    /// Malformed or refused handshakes.
    pub handshake_failures: AtomicU64,
    /// Sessions refused because the backend was unavailable.
    pub backend_unavailable: AtomicU64,
    /// Sessions torn down by an I/O error.
    pub relay_errors: AtomicU64,
    /// Sessions aborted at the end of the grace period.
    pub sessions_aborted: AtomicU64,
    /// Bytes relayed to the backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed from the backend.
    pub bytes_from_backend: AtomicU64,
}

/// How a connection ended, when it ended without error.
#[derive(Debug)]
enum Outcome {
    Relayed(RelayStats),
    Served,
}

/// Decrements the active count however the session task ends.
struct ConnectionGuard {
    stats: Arc<ListenerStats>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-connection dispatch shared by all session tasks.
struct FrontDoor {
    mode: Mode,
    routes: RouteConfig,
    head: HeadConfig,
    engine: Arc<RelayEngine>,
    local: Arc<LocalHandlers>,
    forwarder: Arc<StreamForwarder>,
}

impl FrontDoor {
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        session: &mut Session,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Outcome, RelayError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        match self.mode {
            Mode::Tcp => self
                .engine
                .relay_tcp(session, stream)
                .await
                .map(Outcome::Relayed),
            Mode::Upgrade => {
                session.transition(SessionState::Handshaking);

                let (head, head_bytes) = match read_request_head(&mut stream, &self.head).await {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        if matches!(e, RelayError::Handshake(_)) {
                            let reject = LocalResponse::status_only(http::StatusCode::BAD_REQUEST);
                            let _ = respond(&mut stream, &reject, true).await;
                        }
                        return Err(e);
                    }
                };

                debug!(method = %head.method, path = %head.path(), "Request head received");

                match classify(&head, self.mode, &self.routes) {
                    Classification::Relay => self
                        .engine
                        .relay_upgrade(session, stream, &head, head_bytes)
                        .await
                        .map(Outcome::Relayed),
                    Classification::Local(route) => {
                        let response = self.local.respond(route);
                        respond(&mut stream, &response, !head.is_head_request()).await?;
                        Ok(Outcome::Served)
                    }
                    Classification::Reject(status) => {
                        let response = LocalResponse::status_only(status);
                        respond(&mut stream, &response, true).await?;
                        Err(RelayError::Handshake(format!(
                            "{} {} refused with {}",
                            head.method,
                            head.path(),
                            status.as_u16()
                        )))
                    }
                }
            }
            Mode::Stream => {
                session.transition(SessionState::Relaying);
                Arc::clone(&self.forwarder)
                    .serve(stream, session.id().to_string(), shutdown)
                    .await
                    .map(|()| Outcome::Served)
            }
        }
    }
}

async fn respond(
    stream: &mut TcpStream,
    response: &LocalResponse,
    include_body: bool,
) -> std::io::Result<()> {
    write_response(
        stream,
        response.status,
        response.content_type,
        &response.body,
        include_body,
    )
    .await?;
    stream.shutdown().await
}

/// The public front door.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Connection dispatch.
    front_door: Arc<FrontDoor>,
    /// Connection semaphore (only when a cap is configured).
    conn_semaphore: Option<Arc<Semaphore>>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the public socket. Failure here is fatal for the process.
    pub async fn bind(
        config: ListenerConfig,
        engine: Arc<RelayEngine>,
        local: Arc<LocalHandlers>,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            mode = %config.mode,
            tunnel_path = ?config.routes.tunnel_path,
            max_connections = ?config.max_connections,
            "Listener bound"
        );

        let forwarder = Arc::new(StreamForwarder::new(
            Arc::clone(&engine),
            config.routes.clone(),
            Arc::clone(&local),
            config.head.clone(),
        ));

        Ok(Self {
            conn_semaphore: config.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            front_door: Arc::new(FrontDoor {
                mode: config.mode,
                routes: config.routes.clone(),
                head: config.head.clone(),
                engine,
                local,
                forwarder,
            }),
            listener,
            config,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` flips, then drain.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Listener {
            config,
            listener,
            front_door,
            conn_semaphore,
            stats,
        } = self;

        let mut sessions = JoinSet::new();
        info!(mode = %config.mode, "Listener started");

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let permit = match &conn_semaphore {
                            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                                Ok(permit) => Some(permit),
                                Err(_) => {
                                    stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                    warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                                    continue;
                                }
                            },
                            None => None,
                        };

                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let guard = ConnectionGuard {
                            stats: Arc::clone(&stats),
                            _permit: permit,
                        };
                        let front_door = Arc::clone(&front_door);
                        let stats = Arc::clone(&stats);
                        let session_shutdown = shutdown.clone();
                        let mut session = Session::new();
                        let span = tracing::info_span!("session", id = %session.id(), peer = %peer_addr);

                        sessions.spawn(
                            async move {
                                let _guard = guard;
                                let result = front_door
                                    .handle_connection(stream, &mut session, session_shutdown)
                                    .await;
                                record_outcome(&stats, result);
                                session.transition(SessionState::Closed);
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        info!(
            active_sessions = sessions.len(),
            grace_period_ms = config.grace_period.as_millis() as u64,
            "Listener closed, draining sessions"
        );

        let drained = tokio::time::timeout(config.grace_period, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let remaining = sessions.len();
            warn!(remaining, "Grace period elapsed, aborting sessions");
            stats
                .sessions_aborted
                .fetch_add(remaining as u64, Ordering::Relaxed);
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        info!("Listener stopped");
    }
}

fn record_outcome(stats: &ListenerStats, result: Result<Outcome, RelayError>) {
    match result {
        Ok(Outcome::Relayed(relayed)) => {
            stats.sessions_relayed.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_to_backend
                .fetch_add(relayed.to_backend, Ordering::Relaxed);
            stats
                .bytes_from_backend
                .fetch_add(relayed.from_backend, Ordering::Relaxed);
            debug!(
                bytes_to_backend = relayed.to_backend,
                bytes_from_backend = relayed.from_backend,
                "Session closed"
            );
        }
        Ok(Outcome::Served) => {
            stats.local_responses.fetch_add(1, Ordering::Relaxed);
            debug!("Connection served");
        }
        Err(e) => {
            match &e {
                RelayError::BackendUnavailable { .. } => {
                    stats.backend_unavailable.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, kind = e.kind(), "Session rejected");
                }
                RelayError::Handshake(_) => {
                    stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, kind = e.kind(), "Session rejected");
                }
                _ => {
                    stats.relay_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, kind = e.kind(), "Session error");
                }
            }
        }
    }
}
