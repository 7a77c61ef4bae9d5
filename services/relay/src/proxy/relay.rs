//! Relay engine: handshake framing and bidirectional splicing.
//!
//! Every session gets its own backend connection. Once framing is done the
//! two directions are copied independently:
//! - EOF in one direction half-closes the peer's write side
//! - after one direction ends, the other keeps going while it moves data;
//!   a gap longer than `linger` closes the session
//! - any I/O error tears down both ends at once
//!
//! ```text
//! Accepted -> Handshaking -> Relaying -> Closed
//!     |            |             |
//!     +------------+-------------+--> Closed (connect failure, I/O error, shutdown)
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

use super::backend::{self, BackendLink, DEFAULT_CONNECT_TIMEOUT};
use super::request::{switching_protocols, write_response, RequestHead};
use super::local::LocalResponse;
use crate::error::RelayError;

/// Default read gap allowed on the surviving direction after a half-close.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Copy buffer size per direction.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay engine configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Backend connect timeout.
    pub connect_timeout: Duration,
    /// Idle timeout per read (none for raw TCP by default).
    pub idle_timeout: Option<Duration>,
    /// Longest read gap allowed once one direction has ended.
    pub linger: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            linger: DEFAULT_LINGER,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    Relaying,
    Closed,
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-connection bookkeeping, owned by the task serving the connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("sess_{n:08x}"),
            state: SessionState::Accepted,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session = %self.id, from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_backend: u64,
    pub from_backend: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// Opens backend connections and splices them to public connections.
pub struct RelayEngine {
    backend: Arc<dyn BackendLink>,
    config: RelayConfig,
}

impl RelayEngine {
    pub fn new(backend: Arc<dyn BackendLink>, config: RelayConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<dyn BackendLink> {
        &self.backend
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Open a new backend connection for one session.
    pub async fn open_backend(&self) -> Result<TcpStream, RelayError> {
        backend::connect(self.backend.as_ref(), self.config.connect_timeout).await
    }

    /// Raw TCP passthrough. On backend failure the public connection is
    /// simply dropped.
    pub async fn relay_tcp<S>(&self, session: &mut Session, public: S) -> Result<RelayStats, RelayError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let backend = self.open_backend().await?;
        session.transition(SessionState::Relaying);
        self.splice(public, backend).await
    }

    /// HTTP upgrade bridging.
    ///
    /// Writes the 101 response to the public side, forwards `head_bytes` to
    /// the backend, then splices. On backend failure a 503 is written and the
    /// public connection is closed.
    pub async fn relay_upgrade<S>(
        &self,
        session: &mut Session,
        mut public: S,
        head: &RequestHead,
        head_bytes: Vec<u8>,
    ) -> Result<RelayStats, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        session.transition(SessionState::Handshaking);

        let mut backend = match self.open_backend().await {
            Ok(stream) => stream,
            Err(e) => {
                let reject = LocalResponse::status_only(StatusCode::SERVICE_UNAVAILABLE);
                if let Err(write_err) = write_response(
                    &mut public,
                    reject.status,
                    reject.content_type,
                    &reject.body,
                    true,
                )
                .await
                {
                    debug!(error = %write_err, "Failed to write rejection");
                }
                let _ = public.shutdown().await;
                return Err(e);
            }
        };

        public.write_all(&switching_protocols(head)).await?;
        public.flush().await?;

        if !head_bytes.is_empty() {
            backend.write_all(&head_bytes).await?;
            debug!(bytes = head_bytes.len(), "Forwarded head bytes");
        }

        session.transition(SessionState::Relaying);
        let mut stats = self.splice(public, backend).await?;
        stats.to_backend += head_bytes.len() as u64;
        Ok(stats)
    }

    /// Copy bytes both ways until both directions are done.
    pub async fn splice<A, B>(&self, a: A, b: B) -> Result<RelayStats, RelayError>
    where
        A: AsyncRead + AsyncWrite,
        B: AsyncRead + AsyncWrite,
    {
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let bounds = CopyBounds {
            idle: self.config.idle_timeout,
            linger: self.config.linger,
        };

        let (up_done_tx, up_done_rx) = watch::channel(false);
        let (down_done_tx, down_done_rx) = watch::channel(false);

        let upstream = copy_half(a_read, b_write, bounds, up_done_tx, down_done_rx);
        let downstream = copy_half(b_read, a_write, bounds, down_done_tx, up_done_rx);

        // The first error drops the other direction, closing both ends.
        let (to_backend, from_backend) = tokio::try_join!(upstream, downstream)?;

        Ok(RelayStats {
            to_backend,
            from_backend,
        })
    }
}

/// Read bounds for one copy direction.
#[derive(Debug, Clone, Copy)]
struct CopyBounds {
    idle: Option<Duration>,
    linger: Duration,
}

impl CopyBounds {
    /// Bound on the next read. Once the peer direction has finished, reads
    /// are limited by `linger`, restarted on every chunk.
    fn next_read(&self, peer_open: bool) -> Option<Duration> {
        if peer_open {
            self.idle
        } else {
            Some(self.idle.map_or(self.linger, |idle| idle.min(self.linger)))
        }
    }
}

/// Copy one direction, then half-close the writer and report completion.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    bounds: CopyBounds,
    done: watch::Sender<bool>,
    mut peer_done: watch::Receiver<bool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let peer_open = !*peer_done.borrow_and_update();
        let bound = bounds.next_read(peer_open);

        let read_result = tokio::select! {
            result = read_within(&mut reader, &mut buf, bound) => result,
            // Re-arm the read with the linger bound.
            _ = peer_done.changed(), if peer_open => continue,
        };

        match read_result {
            Ok(0) => break,
            Ok(n) => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut && !peer_open => {
                debug!(
                    linger_ms = bounds.linger.as_millis() as u64,
                    bytes = total,
                    "Linger elapsed, closing session"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Half-close failed");
    }
    done.send_replace(true);
    Ok(total)
}

async fn read_within<R>(reader: &mut R, buf: &mut [u8], bound: Option<Duration>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match bound {
        Some(bound) => match timeout(bound, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        },
        None => reader.read(buf).await,
    }
}
