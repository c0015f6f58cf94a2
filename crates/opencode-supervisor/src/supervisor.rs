//! Start/stop/readiness lifecycle of one supervised server process.

use std::{
    fmt, io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use opencode_client::ApiClient;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    command::ServeCommand,
    config::{ChildOutput, Config},
    env::Environment,
    port::{self, LOOPBACK},
    stage::{self, CONFIG_FILE, StageError},
};

/// Interval between readiness probes.
pub const READY_INTERVAL: Duration = Duration::from_millis(500);

/// Failed probes between two progress log lines.
const LOG_EVERY: u32 = 10;

const CHILD_TARGET: &str = "opencode::child";

/// Supervisor error.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Server is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("Failed to allocate a free port: {0}")]
    PortAllocationFailed(#[source] io::Error),
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
    #[error("Failed to stage config: {0}")]
    ConfigStagingFailed(#[from] StageError),
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Server not ready after {attempts} attempts")]
    NotReady { attempts: u32 },
    #[error("Server process exited: {0}")]
    ProcessExited(ProcessExit),
    #[error("Failed to stop server: {0}")]
    StopFailed(#[source] io::Error),
    #[error("Failed to remove config directory {}: {source}", path.display())]
    CleanupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How a server process ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(ExitStatus),
    /// Waiting on the process failed; its status is unknown.
    Lost(String),
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{status}"),
            Self::Lost(error) => write!(f, "wait failed: {error}"),
        }
    }
}

/// Observable lifecycle of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Idle,
    Starting,
    Running {
        pid: u32,
    },
    Stopping,
    /// The process ended without being asked to.
    Exited(ProcessExit),
}

impl LifecycleState {
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        match self {
            Self::Running { pid } => Some(*pid),
            _ => None,
        }
    }
}

/// Budget for [`OpenCode::wait_for_ready`].
#[derive(Debug, Clone)]
pub enum ReadyBudget {
    /// Give up after this many probes.
    Attempts(u32),
    /// Give up once this much time has passed.
    Timeout(Duration),
    /// Give up when the token is cancelled.
    Until(CancellationToken),
}

impl From<u32> for ReadyBudget {
    fn from(attempts: u32) -> Self {
        Self::Attempts(attempts)
    }
}

impl From<Duration> for ReadyBudget {
    fn from(timeout: Duration) -> Self {
        Self::Timeout(timeout)
    }
}

impl From<CancellationToken> for ReadyBudget {
    fn from(token: CancellationToken) -> Self {
        Self::Until(token)
    }
}

type KillReply = oneshot::Sender<io::Result<()>>;

struct ChildHandle {
    pid: u32,
    kill_tx: oneshot::Sender<KillReply>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    child: Option<ChildHandle>,
    /// Root created by staging, owned by this instance until cleanup.
    staged: Option<PathBuf>,
}

/// One supervised opencode server.
///
/// `start` and `stop` are serialized by an internal lock. Readiness polling
/// and the clients handed out by [`client`](Self::client) only read the
/// current address and root, so they never wait on that lock.
///
/// Dropping the instance kills a running server. A staged root is only
/// removed by [`cleanup`](Self::cleanup) or [`shutdown`](Self::shutdown).
pub struct OpenCode {
    config: Config,
    env: Environment,
    http: reqwest::Client,
    addr: RwLock<String>,
    root: RwLock<Option<PathBuf>>,
    inner: Mutex<Inner>,
    state: Arc<watch::Sender<LifecycleState>>,
}

impl OpenCode {
    /// Create an idle instance that hands the server a snapshot of the
    /// current process environment.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_environment(config, Environment::capture())
    }

    /// Create an idle instance with an explicit environment. The server sees
    /// exactly `env` plus the isolation variables, and config files are
    /// expanded against it.
    #[must_use]
    pub fn with_environment(config: Config, env: Environment) -> Self {
        let addr = config.addr.clone().unwrap_or_default();
        let root = if config.config_files.is_none() {
            config.isolation_root.clone()
        } else {
            None
        };
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            config,
            env,
            http: loopback_client(),
            addr: RwLock::new(addr),
            root: RwLock::new(root),
            inner: Mutex::new(Inner::default()),
            state: Arc::new(state),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Current `host:port`, empty until one is configured or allocated.
    #[must_use]
    pub fn addr(&self) -> String {
        read(&self.addr)
    }

    /// Isolation root the server runs in, if any.
    #[must_use]
    pub fn isolation_root(&self) -> Option<PathBuf> {
        read(&self.root)
    }

    /// Client bound to the current address, scoped to the isolation root.
    #[must_use]
    pub fn client(&self) -> ApiClient {
        let client = ApiClient::with_http_client(self.http.clone(), self.addr());
        match self.isolation_root() {
            Some(root) => client.with_directory(root),
            None => client,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Watch lifecycle transitions, including unexpected exits.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.state.borrow().pid()
    }

    /// Launch the server.
    ///
    /// A handle left behind by a server that already exited is discarded
    /// first.
    ///
    /// # Errors
    /// Returns [`SupervisorError::AlreadyRunning`] if a live server exists,
    /// or the first failure of port allocation, staging, spawn or the
    /// post-spawn liveness check. The instance is idle again on error.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        if let Some(stale) = inner.child.take_if(|h| h.watcher.is_finished()) {
            tracing::debug!(pid = stale.pid, "Discarding handle of exited server");
        }
        if let Some(handle) = &inner.child {
            return Err(SupervisorError::AlreadyRunning { pid: handle.pid });
        }

        self.state.send_replace(LifecycleState::Starting);
        match self.launch(&mut inner).await {
            Ok(handle) => {
                inner.child = Some(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start server");
                self.state.send_replace(LifecycleState::Idle);
                Err(e)
            }
        }
    }

    async fn launch(&self, inner: &mut Inner) -> Result<ChildHandle, SupervisorError> {
        let (addr, port) = self.resolve_addr()?;
        let root = self.prepare_root(inner).await?;
        let config_file = self
            .config
            .config_files
            .as_ref()
            .filter(|files| files.contains(CONFIG_FILE))
            .and(root.as_ref())
            .map(|root| root.join(CONFIG_FILE));
        let vars = stage::isolation_vars(
            root.as_deref(),
            config_file.as_deref(),
            self.config.api_key.as_deref(),
        );

        let (program, args) = ServeCommand::new(&self.config.binary, port)
            .build()
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env_clear()
            .envs(self.env.iter())
            .envs(vars)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        match self.config.output {
            ChildOutput::Inherit => command.stdout(Stdio::inherit()).stderr(Stdio::inherit()),
            ChildOutput::Null => command.stdout(Stdio::null()).stderr(Stdio::null()),
            ChildOutput::Trace => command.stdout(Stdio::piped()).stderr(Stdio::piped()),
        };

        tracing::debug!(program = %program.display(), ?args, "Spawning server");
        let mut child = command
            .group_spawn()
            .map_err(|e| SupervisorError::SpawnFailed(format!("{}: {e}", program.display())))?;
        let pid = child.id().ok_or_else(|| {
            SupervisorError::SpawnFailed("process exited before its pid was read".to_string())
        })?;

        if self.config.output == ChildOutput::Trace {
            if let Some(stdout) = child.inner().stdout.take() {
                tokio::spawn(forward_output(stdout, pid, "stdout"));
            }
            if let Some(stderr) = child.inner().stderr.take() {
                tokio::spawn(forward_output(stderr, pid, "stderr"));
            }
        }

        write(&self.addr, addr.clone());
        write(&self.root, root);

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_child(child, pid, kill_rx, Arc::clone(&self.state)));
        let handle = ChildHandle {
            pid,
            kill_tx,
            watcher,
        };

        tokio::time::sleep(self.config.startup_grace).await;
        let alive = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running { pid };
                true
            } else {
                false
            }
        });
        if !alive {
            let reason = match self.state() {
                LifecycleState::Exited(exit) => exit.to_string(),
                other => format!("{other:?}"),
            };
            return Err(SupervisorError::SpawnFailed(format!(
                "server exited during startup: {reason}"
            )));
        }

        tracing::info!(pid, port, addr = %addr, "Server started");
        Ok(handle)
    }

    /// An empty configured address counts as unset.
    fn resolve_addr(&self) -> Result<(String, u16), SupervisorError> {
        match self.config.addr.as_deref().filter(|a| !a.is_empty()) {
            Some(addr) => port::port_of(addr)
                .map(|port| (addr.to_string(), port))
                .ok_or_else(|| SupervisorError::InvalidAddress(addr.to_string())),
            None => {
                let port = port::allocate_port().map_err(SupervisorError::PortAllocationFailed)?;
                Ok((format!("{LOOPBACK}:{port}"), port))
            }
        }
    }

    /// Effective isolation root. A config set is staged into a fresh root on
    /// every start, replacing the previous one.
    async fn prepare_root(&self, inner: &mut Inner) -> Result<Option<PathBuf>, SupervisorError> {
        let Some(files) = &self.config.config_files else {
            return Ok(self.config.isolation_root.clone());
        };
        self.remove_staged(inner).await?;
        let base = self
            .config
            .staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        inner.staged = Some(stage::stage(files, &self.env, &base).await?);
        Ok(inner.staged.clone())
    }

    /// Kill the server's process group. Succeeds when nothing is running.
    ///
    /// # Errors
    /// Returns [`SupervisorError::StopFailed`] if the kill signal cannot be
    /// delivered. The handle is cleared either way.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.child.take() else {
            tracing::debug!("Stop requested with no server running");
            return Ok(());
        };

        let pid = handle.pid;
        tracing::info!(pid, "Stopping server");
        self.state.send_replace(LifecycleState::Stopping);

        let (reply_tx, reply_rx) = oneshot::channel();
        // A closed channel means the watcher already reaped the process.
        let result = match handle.kill_tx.send(reply_tx) {
            Ok(()) => reply_rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };
        if let Err(e) = handle.watcher.await {
            tracing::warn!(pid, error = %e, "Server watcher task failed");
        }
        self.state.send_replace(LifecycleState::Idle);

        result.map_err(SupervisorError::StopFailed)?;
        tracing::info!(pid, "Server stopped");
        Ok(())
    }

    /// Remove the staged isolation root. Succeeds when there is none.
    ///
    /// # Errors
    /// Returns [`SupervisorError::CleanupFailed`] if the directory exists but
    /// cannot be removed; the root stays recorded so cleanup can be retried.
    pub async fn cleanup(&self) -> Result<(), SupervisorError> {
        let mut inner = self.inner.lock().await;
        self.remove_staged(&mut inner).await
    }

    async fn remove_staged(&self, inner: &mut Inner) -> Result<(), SupervisorError> {
        let Some(root) = inner.staged.clone() else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => tracing::info!(path = %root.display(), "Removed config directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %root.display(), "Config directory already gone");
            }
            Err(source) => return Err(SupervisorError::CleanupFailed { path: root, source }),
        }

        inner.staged = None;
        let mut current = self.root.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() == Some(&root) {
            *current = None;
        }
        Ok(())
    }

    /// Stop, then clean up.
    ///
    /// # Errors
    /// Returns the stop error if stopping failed, else the cleanup error.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        let stopped = self.stop().await;
        let cleaned = self.cleanup().await;
        stopped.and(cleaned)
    }

    /// Poll the health endpoint every [`READY_INTERVAL`] until the server
    /// answers, returning the number of probes it took.
    ///
    /// # Errors
    /// Returns [`SupervisorError::NotReady`] when the budget runs out and
    /// [`SupervisorError::ProcessExited`] if the server dies while waiting.
    pub async fn wait_for_ready(
        &self,
        budget: impl Into<ReadyBudget>,
    ) -> Result<u32, SupervisorError> {
        let mut attempts = 0;
        let polled = match budget.into() {
            ReadyBudget::Attempts(max) => Some(self.poll_health(Some(max), &mut attempts).await),
            ReadyBudget::Timeout(limit) => {
                tokio::time::timeout(limit, self.poll_health(None, &mut attempts))
                    .await
                    .ok()
            }
            ReadyBudget::Until(token) => tokio::select! {
                biased;
                () = token.cancelled() => None,
                result = self.poll_health(None, &mut attempts) => Some(result),
            },
        };

        polled.unwrap_or_else(|| {
            tracing::warn!(attempts, "Readiness wait ended before the server answered");
            Err(SupervisorError::NotReady { attempts })
        })
    }

    async fn poll_health(&self, max: Option<u32>, attempts: &mut u32) -> Result<u32, SupervisorError> {
        let mut ticker = tokio::time::interval(READY_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = self.state.subscribe();

        loop {
            if max.is_some_and(|max| *attempts >= max) {
                tracing::warn!(attempts = *attempts, "Server not ready, giving up");
                return Err(SupervisorError::NotReady {
                    attempts: *attempts,
                });
            }
            ticker.tick().await;

            if let LifecycleState::Exited(exit) = &*state.borrow_and_update() {
                return Err(SupervisorError::ProcessExited(exit.clone()));
            }

            *attempts += 1;
            let client = ApiClient::with_http_client(self.http.clone(), self.addr());
            match client.health().await {
                Ok(()) => {
                    tracing::info!(attempts = *attempts, addr = %client.addr(), "Server ready");
                    return Ok(*attempts);
                }
                Err(e) if *attempts % LOG_EVERY == 0 => {
                    tracing::debug!(attempt = *attempts, error = %e, "Server not ready yet");
                }
                Err(_) => {}
            }
        }
    }
}

impl fmt::Debug for OpenCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenCode")
            .field("config", &self.config)
            .field("addr", &self.addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Reap the child, or kill its group when asked to. A dropped request
/// sender also kills, which covers dropping the instance.
async fn watch_child(
    mut child: AsyncGroupChild,
    pid: u32,
    kill_rx: oneshot::Receiver<KillReply>,
    state: Arc<watch::Sender<LifecycleState>>,
) {
    enum Outcome {
        Exited(io::Result<ExitStatus>),
        Kill(Option<KillReply>),
    }

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        request = kill_rx => Outcome::Kill(request.ok()),
    };

    match outcome {
        Outcome::Exited(status) => {
            let exit = match status {
                Ok(status) => ProcessExit::Exited(status),
                Err(e) => ProcessExit::Lost(e.to_string()),
            };
            tracing::warn!(pid, %exit, "Server process exited");
            state.send_if_modified(|current| {
                if matches!(current, LifecycleState::Starting | LifecycleState::Running { .. }) {
                    *current = LifecycleState::Exited(exit);
                    true
                } else {
                    false
                }
            });
        }
        Outcome::Kill(reply) => {
            let result = kill_group(&mut child).await;
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        tracing::warn!(pid, error = %e, "Failed to kill orphaned server");
                    }
                }
            }
        }
    }
}

async fn kill_group(child: &mut AsyncGroupChild) -> io::Result<()> {
    if let Err(e) = child.start_kill() {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        return Err(e);
    }
    child.wait().await.map(|_| ())
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R, pid: u32, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(target: CHILD_TARGET, pid, stream = name, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: CHILD_TARGET, pid, stream = name, error = %e, "Output forwarding stopped");
                break;
            }
        }
    }
}

/// The server is local; proxies from the environment never apply.
fn loopback_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap_or_default()
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::assert_ok;

    use super::*;
    use crate::config::VirtualFileSet;

    /// Config whose "binary" is a shell script; the serve arguments land in
    /// `$1..$5`.
    fn script(body: &str) -> Config {
        Config::default()
            .with_binary(format!("sh -c '{body}' sh"))
            .with_output(ChildOutput::Null)
            .with_startup_grace(Duration::from_millis(200))
    }

    fn sleeper() -> Config {
        script("exec sleep 30")
    }

    fn is_alive(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            if !is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    async fn read_when_written(path: &Path) -> String {
        for _ in 0..50 {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if content.ends_with('\n') {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("{} was never written", path.display());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let opencode = OpenCode::new(sleeper());
        assert_ok!(opencode.stop().await);
        assert_ok!(opencode.stop().await);
        assert_ok!(opencode.cleanup().await);
        assert_eq!(opencode.state(), LifecycleState::Idle);
        assert_eq!(opencode.addr(), "");
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let opencode = OpenCode::new(sleeper());
        opencode.start().await.unwrap();
        let pid = opencode.pid().unwrap();
        assert!(opencode.state().is_running());

        let err = opencode.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { pid: p } if p == pid));
        assert_eq!(opencode.pid(), Some(pid));

        opencode.stop().await.unwrap();
        assert_eq!(opencode.state(), LifecycleState::Idle);
        assert!(wait_until_gone(pid).await);
        assert_ok!(opencode.stop().await);
    }

    #[tokio::test]
    async fn test_empty_address_is_allocated() {
        let first = OpenCode::new(sleeper().with_addr(""));
        let second = OpenCode::new(sleeper().with_addr(""));
        first.start().await.unwrap();
        second.start().await.unwrap();

        let (a, b) = (first.addr(), second.addr());
        assert!(a.starts_with("127.0.0.1:"));
        assert!(port::port_of(&a).is_some());
        assert_ne!(a, b);

        first.stop().await.unwrap();
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_get_distinct_ports() {
        let first = OpenCode::new(sleeper());
        let second = OpenCode::new(sleeper());
        first.start().await.unwrap();
        second.start().await.unwrap();

        let (a, b) = (first.addr(), second.addr());
        assert!(a.starts_with("127.0.0.1:"));
        assert_ne!(a, b);

        first.stop().await.unwrap();
        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_address_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let config = script(&format!("echo \"$*\" > {}; exec sleep 30", out.display()))
            .with_addr("localhost:45123");
        let opencode = OpenCode::new(config);
        opencode.start().await.unwrap();

        assert_eq!(opencode.addr(), "localhost:45123");
        assert_eq!(
            read_when_written(&out).await.trim_end(),
            "serve --hostname 127.0.0.1 --port 45123"
        );
        opencode.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let opencode = OpenCode::new(sleeper().with_addr("localhost"));
        let err = opencode.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidAddress(_)));
        assert_eq!(opencode.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_immediate_exit_is_spawn_failure() {
        let opencode = OpenCode::new(script("exit 3"));
        let err = opencode.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed(_)));
        assert_eq!(opencode.state(), LifecycleState::Idle);
        assert_ok!(opencode.stop().await);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let config = sleeper().with_binary("definitely-not-a-real-binary-xyz");
        let opencode = OpenCode::new(config);
        let err = opencode.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed(_)));
        assert_eq!(opencode.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_observable_and_restartable() {
        let opencode = OpenCode::new(script("sleep 0.5"));
        let mut states = opencode.subscribe();
        opencode.start().await.unwrap();

        let exited = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, LifecycleState::Exited(_))),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        let LifecycleState::Exited(ProcessExit::Exited(status)) = exited else {
            panic!("unexpected state {exited:?}");
        };
        assert!(status.success());

        opencode.start().await.unwrap();
        assert!(opencode.state().is_running());
        opencode.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_after_exit_succeeds() {
        let opencode = OpenCode::new(script("sleep 0.3"));
        opencode.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_ok!(opencode.stop().await);
        assert_eq!(opencode.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_drop_kills_server() {
        let opencode = OpenCode::new(sleeper());
        opencode.start().await.unwrap();
        let pid = opencode.pid().unwrap();
        drop(opencode);
        assert!(wait_until_gone(pid).await);
    }

    #[tokio::test]
    async fn test_staged_environment_reaches_server() {
        let staging = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let out = out_dir.path().join("env");

        let files = VirtualFileSet::new().with_file(CONFIG_FILE, r#"{"token":"${TOKEN}"}"#);
        let config = script(&format!(
            "echo \"$HOME|$XDG_CONFIG_HOME|$OPENCODE_CONFIG_DIR|$OPENCODE_CONFIG|$OPENCODE_API_KEY\" > {}; exec sleep 30",
            out.display()
        ))
        .with_config_files(files)
        .with_staging_dir(staging.path())
        .with_api_key("sk-test");
        let env = Environment::capture().with_var("TOKEN", "abc");
        let opencode = OpenCode::with_environment(config, env);

        opencode.start().await.unwrap();
        let root = opencode.isolation_root().unwrap();
        assert!(root.starts_with(staging.path()));
        assert_eq!(
            std::fs::read_to_string(root.join(CONFIG_FILE)).unwrap(),
            r#"{"token":"abc"}"#
        );

        let root_str = root.display().to_string();
        let expected = format!(
            "{root_str}|{root_str}|{root_str}|{root_str}/{CONFIG_FILE}|sk-test"
        );
        assert_eq!(read_when_written(&out).await.trim_end(), expected);

        let client = opencode.client();
        assert_eq!(client.directory(), Some(root_str.as_str()));

        opencode.shutdown().await.unwrap();
        assert!(!root.exists());
        assert_eq!(opencode.isolation_root(), None);
        assert_ok!(opencode.cleanup().await);
    }

    #[tokio::test]
    async fn test_each_start_stages_fresh_root() {
        let staging = tempfile::tempdir().unwrap();
        let files = VirtualFileSet::new().with_file("agent/notes.md", "notes");
        let opencode = OpenCode::new(sleeper().with_config_files(files).with_staging_dir(staging.path()));

        opencode.start().await.unwrap();
        let first = opencode.isolation_root().unwrap();
        std::fs::write(first.join("agent/notes.md"), "edited by server").unwrap();
        std::fs::write(first.join("sessions.db"), "state").unwrap();
        opencode.stop().await.unwrap();

        opencode.start().await.unwrap();
        let second = opencode.isolation_root().unwrap();
        assert_ne!(second, first);
        assert!(!first.exists());
        assert!(!second.join("sessions.db").exists());
        assert_eq!(std::fs::read_to_string(second.join("agent/notes.md")).unwrap(), "notes");
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 1);

        opencode.shutdown().await.unwrap();
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_staging_failure_aborts_start() {
        let staging = tempfile::tempdir().unwrap();
        let files = VirtualFileSet::new().with_file("../outside.json", "{}");
        let opencode = OpenCode::new(sleeper().with_config_files(files).with_staging_dir(staging.path()));

        let err = opencode.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigStagingFailed(StageError::InvalidPath(_))));
        assert_eq!(opencode.state(), LifecycleState::Idle);
        assert_eq!(opencode.pid(), None);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_plain_isolation_root_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let opencode = OpenCode::new(sleeper().with_isolation_root(dir.path()));
        opencode.start().await.unwrap();
        opencode.shutdown().await.unwrap();
        assert!(dir.path().exists());
        assert_eq!(opencode.isolation_root().as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_trace_output_mode() {
        let opencode = OpenCode::new(
            script("echo hello; echo oops >&2; exec sleep 30").with_output(ChildOutput::Trace),
        );
        opencode.start().await.unwrap();
        opencode.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_on_third_attempt() {
        let listener = tokio::net::TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                drop(socket);
            }
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        let opencode = OpenCode::new(Config::default().with_addr(addr));
        assert_eq!(opencode.wait_for_ready(5_u32).await.unwrap(), 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_when_attempts_run_out() {
        let port = port::allocate_port().unwrap();
        let opencode = OpenCode::new(Config::default().with_addr(format!("{LOOPBACK}:{port}")));

        let err = opencode.wait_for_ready(2_u32).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { attempts: 2 }));

        let err = opencode.wait_for_ready(0_u32).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { attempts: 0 }));
    }

    #[tokio::test]
    async fn test_not_ready_without_address() {
        let opencode = OpenCode::new(Config::default());
        let err = opencode.wait_for_ready(1_u32).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_not_ready_on_timeout() {
        let port = port::allocate_port().unwrap();
        let opencode = OpenCode::new(Config::default().with_addr(format!("{LOOPBACK}:{port}")));

        let err = opencode
            .wait_for_ready(Duration::from_millis(700))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { attempts } if attempts >= 1));
    }

    #[tokio::test]
    async fn test_not_ready_when_cancelled() {
        let opencode = OpenCode::new(Config::default().with_addr("127.0.0.1:1"));
        let token = CancellationToken::new();
        token.cancel();
        let err = opencode.wait_for_ready(token).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady { attempts: 0 }));
    }

    #[tokio::test]
    async fn test_wait_reports_process_exit() {
        let opencode = OpenCode::new(script("sleep 0.4"));
        opencode.start().await.unwrap();
        let err = opencode.wait_for_ready(40_u32).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessExited(ProcessExit::Exited(_))));
        assert_ok!(opencode.stop().await);
    }

    #[test]
    fn test_client_scoping() {
        let opencode = OpenCode::new(
            Config::default()
                .with_addr("127.0.0.1:4096")
                .with_isolation_root("/srv/opencode"),
        );
        let client = opencode.client();
        assert_eq!(client.addr(), "127.0.0.1:4096");
        assert_eq!(client.directory(), Some("/srv/opencode"));

        let unscoped = OpenCode::new(Config::default()).client();
        assert_eq!(unscoped.addr(), "");
        assert_eq!(unscoped.directory(), None);
    }

    #[test]
    fn test_budget_conversions() {
        assert!(matches!(ReadyBudget::from(3_u32), ReadyBudget::Attempts(3)));
        assert!(matches!(
            ReadyBudget::from(Duration::from_secs(1)),
            ReadyBudget::Timeout(_)
        ));
        assert!(matches!(
            ReadyBudget::from(CancellationToken::new()),
            ReadyBudget::Until(_)
        ));
    }
}
