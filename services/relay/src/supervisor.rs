//! Backend process supervision.
//!
//! A single task owns each supervised child process and drives it through
//! an explicit state machine:
//!
//! ```text
//! Starting -> Running -> Exited -> (backoff) -> Starting -> ...
//!     |                                 ^
//!     +--- launch error ----------------+
//!     +--- too many launch errors -> Failed
//! ```
//!
//! Because only that task ever touches the child, start and exit
//! transitions are serialized and at most one restart is pending at a time.
//! State is published through a `watch` channel so readers never block the
//! supervisor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::descriptor::extract_quick_tunnel_domain;
use crate::error::RelayError;
use crate::proxy::BackendLink;

/// How long a killed child gets to exit before we stop waiting.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between readiness checks.
const READY_CHECK_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Command
// =============================================================================

/// Identity of a supervised process: executable, arguments, working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    /// Name used in logs.
    pub name: String,
    /// Executable path.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory (inherited when unset).
    pub working_dir: Option<PathBuf>,
}

impl BackendCommand {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn spawn(&self) -> Result<Child, RelayError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|source| RelayError::Launch {
            program: self.program.clone(),
            source,
        })
    }
}

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    /// Launch in progress.
    Starting,
    /// Process spawned and not yet exited.
    Running { pid: Option<u32> },
    /// Process exited (code is `None` when killed by a signal); restart pending.
    Exited { code: Option<i32> },
    /// Launch failure ceiling exceeded. Terminal.
    Failed,
    /// Supervisor shut down. Terminal.
    Stopped,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Starting => "starting",
            BackendState::Running { .. } => "running",
            BackendState::Exited { .. } => "exited",
            BackendState::Failed => "failed",
            BackendState::Stopped => "stopped",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, BackendState::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendState::Failed | BackendState::Stopped)
    }
}

/// Supervisor counters.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    /// Successful spawns.
    pub launches: AtomicU64,
    /// Spawn failures.
    pub launch_failures: AtomicU64,
    /// Observed process exits.
    pub exits: AtomicU64,
    /// Restarts scheduled (one per exit or launch failure).
    pub restarts_scheduled: AtomicU64,
}

// =============================================================================
// Policies
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    pub base: Duration,
    /// Maximum delay.
    pub max: Duration,
    /// Jitter factor (0.0 to 1.0), only ever added on top of the delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given consecutive attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = delay * self.jitter.clamp(0.0, 1.0) * rand::random::<f64>();
        let final_delay = (delay + jitter).min(self.max.as_millis() as f64);

        Duration::from_millis(final_delay as u64).max(self.base.min(self.max))
    }
}

/// Restart behaviour for a supervised process.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay schedule between restarts.
    pub backoff: BackoffPolicy,
    /// Consecutive launch failures after which the supervisor gives up.
    pub max_launch_failures: Option<u32>,
    /// Uptime after which the backoff attempt counter resets.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            stable_after: backoff.max,
            backoff,
            max_launch_failures: None,
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns one child process and restarts it when it exits.
pub struct Supervisor {
    command: BackendCommand,
    policy: RestartPolicy,
    state_tx: watch::Sender<BackendState>,
    stats: Arc<SupervisorStats>,
    domain_sink: Option<watch::Sender<Option<String>>>,
}

impl Supervisor {
    /// Create a supervisor for the given command.
    pub fn new(command: BackendCommand, policy: RestartPolicy) -> Self {
        let (state_tx, _) = watch::channel(BackendState::Starting);
        Self {
            command,
            policy,
            state_tx,
            stats: Arc::new(SupervisorStats::default()),
            domain_sink: None,
        }
    }

    /// Publish quick-tunnel hostnames found in the process output.
    pub fn with_domain_sink(mut self, sink: watch::Sender<Option<String>>) -> Self {
        self.domain_sink = Some(sink);
        self
    }

    /// Start supervising. The task exits once `shutdown` flips to true (after
    /// terminating the child) or the launch failure ceiling is hit.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (SupervisorHandle, JoinHandle<()>) {
        let handle = SupervisorHandle {
            name: self.command.name.clone(),
            state: self.state_tx.subscribe(),
            stats: Arc::clone(&self.stats),
        };
        let task = tokio::spawn(self.run(shutdown));
        (handle, task)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.command.name.clone();
        let mut attempt: u32 = 0;
        let mut launch_failures: u32 = 0;

        info!(
            backend = %name,
            program = %self.command.program.display(),
            args = ?self.command.args,
            "Starting supervisor"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state_tx.send_replace(BackendState::Starting);

            match self.command.spawn() {
                Ok(mut child) => {
                    launch_failures = 0;
                    self.stats.launches.fetch_add(1, Ordering::Relaxed);

                    let pid = child.id();
                    self.state_tx.send_replace(BackendState::Running { pid });
                    info!(backend = %name, pid = ?pid, "Backend launched");

                    self.capture_output(&mut child);
                    let started = Instant::now();

                    let exited = tokio::select! {
                        status = child.wait() => Some(status),
                        _ = wait_for_shutdown(&mut shutdown) => None,
                    };
                    let Some(status) = exited else {
                        terminate(&name, child).await;
                        break;
                    };

                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!(backend = %name, error = %e, "Failed to reap backend");
                            None
                        }
                    };
                    self.on_exit(code);

                    if started.elapsed() >= self.policy.stable_after {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    launch_failures += 1;
                    self.stats.launch_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        backend = %name,
                        error = %e,
                        kind = e.kind(),
                        consecutive_failures = launch_failures,
                        "Backend launch failed"
                    );

                    if let Some(ceiling) = self.policy.max_launch_failures {
                        if launch_failures >= ceiling {
                            error!(
                                backend = %name,
                                ceiling,
                                "Launch failure ceiling reached, giving up"
                            );
                            self.state_tx.send_replace(BackendState::Failed);
                            return;
                        }
                    }
                }
            }

            let delay = self.policy.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            self.stats.restarts_scheduled.fetch_add(1, Ordering::Relaxed);
            info!(
                backend = %name,
                delay_ms = delay.as_millis() as u64,
                attempt,
                "Scheduling backend restart"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        self.state_tx.send_replace(BackendState::Stopped);
        info!(backend = %name, "Supervisor stopped");
    }

    /// Record a process exit. Called once per child lifetime.
    fn on_exit(&self, code: Option<i32>) {
        self.stats.exits.fetch_add(1, Ordering::Relaxed);
        self.state_tx.send_replace(BackendState::Exited { code });
        warn!(backend = %self.command.name, code = ?code, "Backend exited");
    }

    /// Forward child stdout/stderr into the log, one event per line.
    fn capture_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(
                self.command.name.clone(),
                "stdout",
                stdout,
                self.domain_sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(
                self.command.name.clone(),
                "stderr",
                stderr,
                self.domain_sink.clone(),
            ));
        }
    }
}

async fn forward_lines<R>(
    name: String,
    stream: &'static str,
    reader: R,
    domain_sink: Option<watch::Sender<Option<String>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: "backend", backend = %name, stream, "{}", line);
                if let (Some(sink), Some(domain)) =
                    (&domain_sink, extract_quick_tunnel_domain(&line))
                {
                    if sink.borrow().as_deref() != Some(domain.as_str()) {
                        info!(backend = %name, domain = %domain, "Public domain discovered");
                        sink.send_replace(Some(domain));
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(backend = %name, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

async fn terminate(name: &str, mut child: Child) {
    info!(backend = %name, pid = ?child.id(), "Terminating backend");
    if let Err(e) = child.start_kill() {
        warn!(backend = %name, error = %e, "Failed to signal backend");
    }
    match tokio::time::timeout(TERMINATE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!(backend = %name, code = ?status.code(), "Backend terminated"),
        Ok(Err(e)) => warn!(backend = %name, error = %e, "Failed to reap backend"),
        Err(_) => warn!(backend = %name, "Backend did not exit in time"),
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Read-only view of a supervised process.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: String,
    state: watch::Receiver<BackendState>,
    stats: Arc<SupervisorStats>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BackendState {
        self.state.borrow().clone()
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `pred`. Returns the matching state, or
    /// `None` if the supervisor went away first.
    pub async fn wait_for<F>(&self, mut pred: F) -> Option<BackendState>
    where
        F: FnMut(&BackendState) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx.wait_for(|s| pred(s)).await.ok().map(|s| s.clone());
        state
    }

    /// Resolves when the supervisor has given up on the process.
    pub async fn failed(&self) {
        if self.wait_for(|s| *s == BackendState::Failed).await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

/// A supervised backend listening on a fixed loopback endpoint.
#[derive(Clone)]
pub struct ManagedBackend {
    endpoint: SocketAddr,
    handle: SupervisorHandle,
}

impl ManagedBackend {
    pub fn new(endpoint: SocketAddr, handle: SupervisorHandle) -> Self {
        Self { endpoint, handle }
    }

    pub fn handle(&self) -> &SupervisorHandle {
        &self.handle
    }

    /// Wait until the process is running and its endpoint accepts connections.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                if self.handle.state().is_running()
                    && TcpStream::connect(self.endpoint).await.is_ok()
                {
                    return;
                }
                tokio::time::sleep(READY_CHECK_INTERVAL).await;
            }
        })
        .await
        .is_ok()
    }
}

impl BackendLink for ManagedBackend {
    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn is_available(&self) -> bool {
        self.handle.state().is_running()
    }

    fn status(&self) -> &'static str {
        self.handle.state().as_str()
    }
}
