//! Front door and relay engine.
//!
//! This module provides:
//! - The public TCP listener and per-connection dispatch
//! - Request-head parsing and routing for the HTTP modes
//! - Locally served endpoints (status, health, descriptor)
//! - Byte splicing between public and backend connections
//! - Streamed HTTP forwarding for the chunked-stream mode
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> (head parse + classify) -> RelayEngine -> Backend
//!                               |
//!                               +-> LocalHandlers (status, health, descriptor)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let engine = Arc::new(RelayEngine::new(backend.clone(), RelayConfig::default()));
//! let local = Arc::new(LocalHandlers::new(descriptor, backend));
//!
//! let listener = Listener::bind(ListenerConfig::from_config(&config), engine, local).await?;
//! listener.run(shutdown_rx).await;
//! ```

mod backend;
mod listener;
mod local;
mod relay;
mod request;
mod stream;

pub use backend::{connect, BackendLink, StaticBackend, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_GRACE_PERIOD};
pub use local::{LocalHandlers, LocalResponse, STATUS_BODY};
pub use relay::{RelayConfig, RelayEngine, RelayStats, Session, SessionState, DEFAULT_LINGER};
pub use request::{
    classify, parse_request_head, read_request_head, switching_protocols, Classification,
    HeadConfig, LocalRoute, RequestHead, RouteConfig, HEALTH_PATH,
};
pub use stream::{StreamBody, StreamForwarder};
