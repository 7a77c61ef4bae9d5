//! Relay error taxonomy.
//!
//! Per-session errors (`BackendUnavailable`, `Handshake`, `RelayIo`) stay
//! inside the session that produced them. `Bind` is fatal at startup and
//! `Launch` is retried by the supervisor.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the supervisor, front door and relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Backend executable missing or not runnable.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Relay attempted while the backend is down, restarting or unreachable.
    #[error("backend {endpoint} unavailable: {reason}")]
    BackendUnavailable { endpoint: SocketAddr, reason: String },

    /// Malformed, oversized or unsupported request framing.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Read/write failure on either side of an established relay.
    #[error("relay I/O error: {0}")]
    RelayIo(#[from] io::Error),

    /// Public listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Launch { .. } => "launch",
            RelayError::BackendUnavailable { .. } => "backend_unavailable",
            RelayError::Handshake(_) => "handshake",
            RelayError::RelayIo(_) => "relay_io",
            RelayError::Bind { .. } => "bind",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = RelayError::BackendUnavailable {
            endpoint: "127.0.0.1:8001".parse().unwrap(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.kind(), "backend_unavailable");
        assert!(err.to_string().contains("127.0.0.1:8001"));

        let err: RelayError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert_eq!(err.kind(), "relay_io");
    }
}
