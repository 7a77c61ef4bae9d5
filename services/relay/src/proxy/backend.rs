//! Backend endpoint access.
//!
//! The relay never talks to the supervisor directly; it sees the backend
//! through [`BackendLink`], which answers two questions: where does the
//! backend listen, and is it worth trying right now.
//!
//! - Connections to a backend that is known to be down fail immediately
//! - Connect attempts are bounded by a timeout (2s default)
//! - Every session gets its own backend connection; nothing is pooled

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::RelayError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Read-only view of the backend the relay forwards to.
pub trait BackendLink: Send + Sync + 'static {
    /// Loopback endpoint the backend listens on.
    fn endpoint(&self) -> SocketAddr;

    /// Whether the backend is currently expected to accept connections.
    fn is_available(&self) -> bool;

    /// Short status string for health reporting.
    fn status(&self) -> &'static str {
        if self.is_available() {
            "running"
        } else {
            "unavailable"
        }
    }
}

/// A backend managed outside this process. Always considered available;
/// connect failures still surface as `BackendUnavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticBackend {
    endpoint: SocketAddr,
}

impl StaticBackend {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self { endpoint }
    }
}

impl BackendLink for StaticBackend {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn is_available(&self) -> bool {
        true
    }

    fn status(&self) -> &'static str {
        "external"
    }
}

/// Open a fresh connection to the backend.
pub async fn connect(
    backend: &dyn BackendLink,
    connect_timeout: Duration,
) -> Result<TcpStream, RelayError> {
    let endpoint = backend.endpoint();

    if !backend.is_available() {
        return Err(RelayError::BackendUnavailable {
            endpoint,
            reason: format!("backend is {}", backend.status()),
        });
    }

    debug!(backend_addr = %endpoint, "Connecting to backend");

    let result = match timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    };

    match result {
        Ok(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY on backend stream");
            }
            Ok(stream)
        }
        Err(e) => Err(RelayError::BackendUnavailable {
            endpoint,
            reason: e.to_string(),
        }),
    }
}
