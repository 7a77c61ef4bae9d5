//! Relay configuration.
//!
//! Everything is read once from the environment at boot and then passed by
//! reference; nothing here is mutated afterwards.

use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::supervisor::{BackendCommand, BackoffPolicy, RestartPolicy};

/// Smallest restart delay the supervisor may be configured with.
pub const MIN_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Default cap for the exponential restart delay.
pub const DEFAULT_MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Default public port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default loopback address the backend listens on.
pub const DEFAULT_BACKEND_ADDR: &str = "127.0.0.1:8001";

/// Default upgrade / stream path.
pub const DEFAULT_TUNNEL_PATH: &str = "/speed";

/// Default client id placed in the published descriptor.
pub const DEFAULT_CLIENT_ID: &str = "9afd1229-b893-40c1-84dd-51e7ce204913";

/// Transport / framing variant served by the front door.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Raw TCP passthrough, no framing.
    Tcp,
    /// HTTP upgrade bridging (WebSocket-compatible).
    Upgrade,
    /// HTTP request/response forwarding with streamed bodies.
    Stream,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Tcp => "tcp",
            Mode::Upgrade => "upgrade",
            Mode::Stream => "stream",
        }
    }

    /// Whether the front door speaks HTTP in this mode.
    pub fn is_http(&self) -> bool {
        !matches!(self, Mode::Tcp)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Mode::Tcp),
            "upgrade" | "ws" | "websocket" => Ok(Mode::Upgrade),
            "stream" | "chunked" | "xhttp" => Ok(Mode::Stream),
            other => bail!("unknown relay mode '{other}' (expected tcp, upgrade or stream)"),
        }
    }
}

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Public address the front door binds to.
    pub bind_addr: SocketAddr,

    /// Active transport variant.
    pub mode: Mode,

    /// Path that is relayed in HTTP modes. `None` rejects all tunnel requests.
    pub tunnel_path: Option<String>,

    /// Path (without leading slash) serving the connection descriptor.
    pub sub_path: String,

    /// Client id embedded in the descriptor.
    pub client_id: Uuid,

    /// Public domain advertised in the descriptor, if known at boot.
    pub public_domain: Option<String>,

    /// Public port advertised in the descriptor.
    pub public_port: u16,

    /// Loopback endpoint the backend listens on.
    pub backend_addr: SocketAddr,

    /// Backend executable. `None` means the backend is managed externally.
    pub backend: Option<BackendCommand>,

    /// Optional edge agent supervised alongside the backend.
    pub sidecar: Option<BackendCommand>,

    /// Restart behaviour for supervised processes.
    pub restart: RestartPolicy,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Time in-flight sessions get to finish after a shutdown signal.
    pub grace_period: Duration,

    /// Optional cap on concurrent public connections.
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let port: u16 = var("PORT")
            .map(|v| v.parse())
            .transpose()
            .context("PORT must be a port number.")?
            .unwrap_or(DEFAULT_PORT);

        let bind_addr = match var("RELAY_BIND_ADDR") {
            Some(addr) => addr
                .parse()
                .context("RELAY_BIND_ADDR must be a socket address.")?,
            None => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
        };

        let mode = var("RELAY_MODE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(Mode::Upgrade);

        let tunnel_path = normalize_tunnel_path(
            &var("RELAY_TUNNEL_PATH").unwrap_or_else(|| DEFAULT_TUNNEL_PATH.to_string()),
        );

        let sub_path = var("SUB_PATH")
            .unwrap_or_else(|| "sub".to_string())
            .trim_start_matches('/')
            .to_string();

        let client_id = var("UUID")
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string())
            .parse()
            .context("UUID must be a valid UUID.")?;

        let public_domain = var("RELAY_PUBLIC_DOMAIN")
            .or_else(|| var("ARGO_DOMAIN"))
            .filter(|d| !d.is_empty());

        let public_port: u16 = var("RELAY_PUBLIC_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_PUBLIC_PORT must be a port number.")?
            .unwrap_or(443);

        let backend_addr: SocketAddr = var("RELAY_BACKEND_ADDR")
            .unwrap_or_else(|| DEFAULT_BACKEND_ADDR.to_string())
            .parse()
            .context("RELAY_BACKEND_ADDR must be a socket address.")?;
        if !backend_addr.ip().is_loopback() {
            bail!("RELAY_BACKEND_ADDR must be a loopback address, got {backend_addr}");
        }

        let working_dir = var("RELAY_BACKEND_DIR").map(PathBuf::from);

        let backend = var("RELAY_BACKEND_BIN")
            .filter(|b| !b.is_empty())
            .map(|bin| {
                let mut cmd = BackendCommand::new("backend", bin)
                    .args(split_args(var("RELAY_BACKEND_ARGS").as_deref()));
                if let Some(dir) = &working_dir {
                    cmd = cmd.current_dir(dir.clone());
                }
                cmd
            });

        let sidecar = var("RELAY_SIDECAR_BIN").filter(|b| !b.is_empty()).map(|bin| {
            BackendCommand::new("sidecar", bin)
                .args(split_args(var("RELAY_SIDECAR_ARGS").as_deref()))
        });

        let base_secs: u64 = var("RELAY_RESTART_BASE_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_RESTART_BASE_SECS must be an integer (seconds).")?
            .unwrap_or(MIN_RESTART_DELAY.as_secs());
        let base = Duration::from_secs(base_secs).max(MIN_RESTART_DELAY);

        let max_secs: u64 = var("RELAY_RESTART_MAX_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_RESTART_MAX_SECS must be an integer (seconds).")?
            .unwrap_or(DEFAULT_MAX_RESTART_DELAY.as_secs());
        let max = Duration::from_secs(max_secs).max(base);

        let max_launch_failures: Option<u32> = var("RELAY_MAX_LAUNCH_FAILURES")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_MAX_LAUNCH_FAILURES must be an integer.")?
            .filter(|n| *n > 0);

        let restart = RestartPolicy {
            backoff: BackoffPolicy {
                base,
                max,
                jitter: 0.1,
            },
            max_launch_failures,
            stable_after: max,
        };

        let connect_timeout_ms: u64 = var("RELAY_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(50));

        let grace_secs: u64 = var("RELAY_GRACE_PERIOD_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_GRACE_PERIOD_SECS must be an integer (seconds).")?
            .unwrap_or(10);
        let grace_period = Duration::from_secs(grace_secs);

        let max_connections: Option<usize> = var("RELAY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_MAX_CONNECTIONS must be an integer.")?
            .filter(|n| *n > 0);

        let log_level = var("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            mode,
            tunnel_path,
            sub_path,
            client_id,
            public_domain,
            public_port,
            backend_addr,
            backend,
            sidecar,
            restart,
            connect_timeout,
            grace_period,
            max_connections,
            log_level,
        })
    }
}

/// Normalize a tunnel path to `/segment`; empty input disables tunneling.
pub fn normalize_tunnel_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{trimmed}"))
    }
}

fn split_args(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
