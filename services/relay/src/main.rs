//! relayd
//!
//! Local relay supervisor.
//!
//! This service:
//! - Launches the tunneling backend and restarts it with backoff when it exits
//! - Optionally supervises an edge agent and learns the public domain from it
//! - Accepts public connections on a single front door
//! - Relays raw TCP, HTTP upgrades or streamed HTTP requests to the backend
//! - Serves a status page, a health check and the connection descriptor

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::future::select_all;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relayd::config::Config;
use relayd::proxy::{
    BackendLink, Listener, ListenerConfig, LocalHandlers, RelayConfig, RelayEngine, StaticBackend,
};
use relayd::supervisor::{ManagedBackend, Supervisor, SupervisorHandle};
use relayd::DescriptorBuilder;

/// How long startup waits for the backend before logging a warning.
const BACKEND_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting relayd");
    info!(
        bind_addr = %config.bind_addr,
        mode = %config.mode,
        tunnel_path = ?config.tunnel_path,
        backend_addr = %config.backend_addr,
        managed_backend = config.backend.is_some(),
        sidecar = config.sidecar.is_some(),
        "Configuration loaded"
    );

    // Create shutdown channels: the front door stops first, children last
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (children_tx, children_rx) = watch::channel(false);

    // Public domain: static config first, sidecar output may fill it in later
    let (domain_tx, domain_rx) = watch::channel(config.public_domain.clone());

    // Start the backend supervisor (or trust an externally managed backend)
    let mut supervisor_tasks = Vec::new();
    let mut supervisor_handles: Vec<SupervisorHandle> = Vec::new();

    let (backend, managed): (Arc<dyn BackendLink>, Option<ManagedBackend>) =
        match config.backend.clone() {
            Some(command) => {
                let (handle, task) =
                    Supervisor::new(command, config.restart.clone()).spawn(children_rx.clone());
                supervisor_tasks.push(task);
                supervisor_handles.push(handle.clone());
                let managed = ManagedBackend::new(config.backend_addr, handle);
                let link: Arc<dyn BackendLink> = Arc::new(managed.clone());
                (link, Some(managed))
            }
            None => {
                info!(
                    backend_addr = %config.backend_addr,
                    "No backend binary configured, relaying to external backend"
                );
                let link: Arc<dyn BackendLink> = Arc::new(StaticBackend::new(config.backend_addr));
                (link, None)
            }
        };

    if let Some(command) = config.sidecar.clone() {
        let (handle, task) = Supervisor::new(command, config.restart.clone())
            .with_domain_sink(domain_tx.clone())
            .spawn(children_rx.clone());
        supervisor_tasks.push(task);
        supervisor_handles.push(handle);
    }

    // Bind the front door (fatal on failure)
    let engine = Arc::new(RelayEngine::new(
        Arc::clone(&backend),
        RelayConfig {
            connect_timeout: config.connect_timeout,
            ..RelayConfig::default()
        },
    ));
    let local = Arc::new(LocalHandlers::new(
        DescriptorBuilder::new(&config, domain_rx.clone()),
        Arc::clone(&backend),
    ));

    let listener = match Listener::bind(ListenerConfig::from_config(&config), engine, local).await
    {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind_addr = %config.bind_addr, error = %e, "Failed to bind listener");
            let _ = children_tx.send(true);
            for task in supervisor_tasks {
                let _ = task.await;
            }
            return Err(e.into());
        }
    };
    let listener_handle = tokio::spawn(listener.run(shutdown_rx));

    // Report readiness once the backend answers
    if let Some(managed) = managed {
        tokio::spawn(async move {
            if managed.wait_ready(BACKEND_READY_TIMEOUT).await {
                info!(backend = %managed.handle().name(), "Backend ready");
            } else {
                warn!(
                    backend = %managed.handle().name(),
                    state = managed.handle().state().as_str(),
                    "Backend not ready yet"
                );
            }
        });
    }

    // Log the descriptor domain as it becomes known
    tokio::spawn({
        let mut domain_rx = domain_rx.clone();
        async move {
            while domain_rx.changed().await.is_ok() {
                let domain = domain_rx.borrow_and_update().clone();
                if let Some(domain) = domain {
                    info!(domain = %domain, "Public domain updated");
                }
            }
        }
    });

    // Wait for shutdown signal
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM");
            Ok(())
        }
        name = any_failed(&supervisor_handles) => {
            error!(process = %name, "Supervised process exceeded its launch failure ceiling");
            Err(name)
        }
    };

    // Signal shutdown: front door first, children last
    let _ = shutdown_tx.send(true);

    info!("Waiting for sessions to drain...");
    if let Err(e) = listener_handle.await {
        error!(error = %e, "Listener task panicked");
    }

    let _ = children_tx.send(true);
    for task in supervisor_tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Supervisor task panicked");
        }
    }

    info!("relayd shutdown complete");
    match outcome {
        Ok(()) => Ok(()),
        Err(name) => bail!("supervised process '{name}' could not be launched"),
    }
}

/// Resolves with the name of the first supervised process that gave up.
async fn any_failed(handles: &[SupervisorHandle]) -> String {
    if handles.is_empty() {
        std::future::pending::<()>().await;
    }
    let waits = handles.iter().map(|handle| {
        Box::pin(async move {
            handle.failed().await;
            handle.name().to_string()
        })
    });
    let (name, _, _) = select_all(waits).await;
    name
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
