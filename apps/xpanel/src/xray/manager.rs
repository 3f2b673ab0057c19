use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};
use xpanel_shared::status::{ProcessPhase, ProcessStatus};

use crate::error::{PanelError, Result};

pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// A child that stays up this long earns back the full restart budget.
pub const STABLE_AFTER: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub bin_path: PathBuf,
    pub config_path: PathBuf,
    pub auto_restart: bool,
    pub restart_max_attempts: u32,
    pub stop_grace: Duration,
    pub stable_after: Duration,
}

/// The operations config deployment needs from whatever runs the proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn test_config(&self, path: &Path) -> Result<String>;
    async fn reload_config(&self) -> Result<ProcessStatus>;
    async fn stop(&self) -> Result<ProcessStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub stable_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Stay,
    Restart { delay: Duration },
}

/// `min(30s, 2^attempts s)`.
pub fn backoff(attempts: u32) -> Duration {
    let secs = 2u64.checked_pow(attempts).unwrap_or(u64::MAX).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug)]
struct Runtime {
    phase: ProcessPhase,
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_attempts: u32,
    stop_requested: bool,
    last_error: Option<String>,
    /// Bumped on every spawn so exits of an older child are recognised.
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            phase: ProcessPhase::Stopped,
            pid: None,
            started_at: None,
            restart_attempts: 0,
            stop_requested: false,
            last_error: None,
            generation: 0,
            kill: None,
        }
    }
}

impl Runtime {
    /// Exit transition: decides synchronously whether the child comes back.
    fn on_exit(&mut self, generation: u64, exit: &str, policy: RestartPolicy) -> ExitAction {
        if generation != self.generation {
            return ExitAction::Stay;
        }
        let stable = self.started_at.is_some_and(|t| t.elapsed() >= policy.stable_after);
        self.pid = None;
        self.started_at = None;
        self.kill = None;

        if self.stop_requested {
            self.stop_requested = false;
            self.phase = ProcessPhase::Stopped;
            return ExitAction::Stay;
        }

        if stable {
            self.restart_attempts = 0;
        }
        self.on_failure(format!("Xray exited unexpectedly ({})", exit), policy)
    }

    /// Unplanned loss of the process, or a failed attempt to bring it back.
    fn on_failure(&mut self, reason: String, policy: RestartPolicy) -> ExitAction {
        if policy.enabled && self.restart_attempts < policy.max_attempts {
            let delay = backoff(self.restart_attempts);
            self.restart_attempts += 1;
            self.phase = ProcessPhase::Crashed;
            self.last_error = Some(reason);
            ExitAction::Restart { delay }
        } else {
            self.phase = ProcessPhase::Stopped;
            self.last_error = Some(if policy.enabled {
                format!("{}; giving up after {} restart attempts", reason, self.restart_attempts)
            } else {
                format!("{}; auto-restart disabled", reason)
            });
            ExitAction::Stay
        }
    }

    fn status(&self) -> ProcessStatus {
        ProcessStatus {
            running: self.phase == ProcessPhase::Running,
            phase: self.phase,
            pid: self.pid,
            uptime_ms: self
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            restart_attempts: self.restart_attempts,
            last_error: self.last_error.clone(),
        }
    }
}

struct Inner {
    settings: ManagerSettings,
    runtime: Mutex<Runtime>,
    /// Serialises start/stop/restart/reload.
    lifecycle: tokio::sync::Mutex<()>,
    /// Generation of the most recently reaped child.
    exited: watch::Sender<u64>,
}

/// Owner of the single Xray child process.
#[derive(Clone)]
pub struct XrayManager {
    inner: Arc<Inner>,
}

impl XrayManager {
    pub fn new(settings: ManagerSettings) -> Self {
        let (exited, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                settings,
                runtime: Mutex::new(Runtime::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                exited,
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: self.inner.settings.auto_restart,
            max_attempts: self.inner.settings.restart_max_attempts,
            stable_after: self.inner.settings.stable_after,
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.inner.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ProcessStatus {
        self.runtime().status()
    }

    pub fn is_running(&self) -> bool {
        self.runtime().phase == ProcessPhase::Running
    }

    pub async fn start(&self) -> Result<ProcessStatus> {
        let _guard = self.inner.lifecycle.lock().await;
        self.start_locked(true).await
    }

    pub async fn stop(&self) -> Result<ProcessStatus> {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_locked().await
    }

    pub async fn restart(&self) -> Result<ProcessStatus> {
        let _guard = self.inner.lifecycle.lock().await;
        self.stop_locked().await?;
        self.start_locked(true).await
    }

    /// SIGHUP to a running child, a full start otherwise.
    pub async fn reload_config(&self) -> Result<ProcessStatus> {
        let _guard = self.inner.lifecycle.lock().await;

        let pid = {
            let rt = self.runtime();
            if rt.phase == ProcessPhase::Running { rt.pid } else { None }
        };

        match pid {
            Some(pid) => {
                send_signal(pid, Signal::Reload).map_err(|e| anyhow::anyhow!("Failed to signal Xray: {}", e))?;
                info!("🔄 Xray config reload signalled (pid {})", pid);
                Ok(self.status())
            }
            None => self.start_locked(true).await,
        }
    }

    /// Dry-run of the binary against `path`; the captured output comes back either way.
    pub async fn test_config(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.inner.settings.bin_path)
            .arg("run")
            .arg("-test")
            .arg("-c")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                PanelError::ProcessSpawnFailed(format!("{}: {}", self.inner.settings.bin_path.display(), e))
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if output.status.success() {
            Ok(combined)
        } else {
            warn!("❌ Xray rejected {}: {}", path.display(), combined);
            Err(PanelError::ConfigTestFailed { output: combined })
        }
    }

    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.inner.settings.bin_path)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                PanelError::ProcessSpawnFailed(format!("{}: {}", self.inner.settings.bin_path.display(), e))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Xray printed no version").into())
    }

    async fn ensure_config_exists(&self) -> Result<()> {
        let path = &self.inner.settings.config_path;
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, "{}").await?;
        warn!("⚠️ No Xray config at {}, wrote an empty placeholder", path.display());
        Ok(())
    }

    async fn start_locked(&self, reset_attempts: bool) -> Result<ProcessStatus> {
        {
            let mut rt = self.runtime();
            if matches!(rt.phase, ProcessPhase::Running | ProcessPhase::Starting) {
                return Ok(rt.status());
            }
            rt.phase = ProcessPhase::Starting;
        }

        if let Err(e) = self.ensure_config_exists().await {
            self.runtime().phase = ProcessPhase::Stopped;
            return Err(e);
        }

        let settings = &self.inner.settings;
        let spawned = Command::new(&settings.bin_path)
            .arg("run")
            .arg("-c")
            .arg(&settings.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", settings.bin_path.display(), e);
                let mut rt = self.runtime();
                rt.phase = ProcessPhase::Stopped;
                rt.last_error = Some(format!("Failed to spawn Xray: {}", message));
                return Err(PanelError::ProcessSpawnFailed(message));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let pid = child.id();
        let generation = {
            let mut rt = self.runtime();
            rt.generation += 1;
            rt.phase = ProcessPhase::Running;
            rt.pid = pid;
            rt.started_at = Some(Instant::now());
            rt.stop_requested = false;
            rt.kill = Some(kill_tx);
            if reset_attempts {
                rt.restart_attempts = 0;
                rt.last_error = None;
            }
            rt.generation
        };

        tokio::spawn(self.clone().watch(child, generation, kill_rx));
        info!("🚀 Xray started (pid {:?})", pid);
        Ok(self.status())
    }

    async fn stop_locked(&self) -> Result<ProcessStatus> {
        let (pid, generation) = {
            let mut rt = self.runtime();
            match rt.phase {
                ProcessPhase::Running | ProcessPhase::Starting => {
                    rt.stop_requested = true;
                    rt.phase = ProcessPhase::Stopping;
                    (rt.pid, rt.generation)
                }
                ProcessPhase::Crashed => {
                    // A pending restart notices the phase change and backs off.
                    rt.phase = ProcessPhase::Stopped;
                    return Ok(rt.status());
                }
                ProcessPhase::Stopped | ProcessPhase::Stopping => return Ok(rt.status()),
            }
        };

        let mut exited = self.inner.exited.subscribe();
        if let Some(pid) = pid {
            if let Err(e) = send_signal(pid, Signal::Terminate) {
                warn!("⚠️ SIGTERM to Xray (pid {}) failed: {}", pid, e);
            }
        }

        let grace = self.inner.settings.stop_grace;
        let graceful = tokio::time::timeout(grace, exited.wait_for(|g| *g >= generation))
            .await
            .is_ok();

        if !graceful {
            warn!("⚠️ Xray did not exit within {:?}, killing it", grace);
            let kill = self.runtime().kill.take();
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
            let _ = exited.wait_for(|g| *g >= generation).await.is_ok();
        }

        info!("🛑 Xray stopped");
        Ok(self.status())
    }

    /// Reaps the child and feeds its exit into the state machine.
    fn watch(self, mut child: Child, generation: u64, kill_rx: oneshot::Receiver<()>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let exit = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let description = match &exit {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };

            let action = self.runtime().on_exit(generation, &description, self.policy());
            self.inner.exited.send_replace(generation);

            if let ExitAction::Restart { delay } = action {
                warn!("💥 Xray exited unexpectedly ({}), restarting in {:?}", description, delay);
                self.recover(generation, delay).await;
            }
        })
    }

    async fn recover(&self, generation: u64, mut delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;
            let _guard = self.inner.lifecycle.lock().await;

            {
                let rt = self.runtime();
                if rt.phase != ProcessPhase::Crashed || rt.generation != generation {
                    return;
                }
            }

            match self.start_locked(false).await {
                Ok(status) => {
                    info!("♻️ Xray restarted (attempt {})", status.restart_attempts);
                    return;
                }
                Err(e) => {
                    error!("❌ Xray restart failed: {}", e);
                    let action = self.runtime().on_failure(e.to_string(), self.policy());
                    match action {
                        ExitAction::Restart { delay: next } => delay = next,
                        ExitAction::Stay => return,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProxyControl for XrayManager {
    async fn test_config(&self, path: &Path) -> Result<String> {
        XrayManager::test_config(self, path).await
    }

    async fn reload_config(&self) -> Result<ProcessStatus> {
        XrayManager::reload_config(self).await
    }

    async fn stop(&self) -> Result<ProcessStatus> {
        XrayManager::stop(self).await
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "xray", "{}", line);
        } else {
            info!(target: "xray", "{}", line);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Reload,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Reload => libc::SIGHUP,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{:?} signal is not supported on this platform", signal),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: RestartPolicy = RestartPolicy { enabled: true, max_attempts: 5, stable_after: STABLE_AFTER };

    fn running(generation: u64) -> Runtime {
        Runtime {
            phase: ProcessPhase::Running,
            pid: Some(4242),
            started_at: Some(Instant::now()),
            generation,
            ..Runtime::default()
        }
    }

    fn manager(dir: &Path) -> XrayManager {
        XrayManager::new(ManagerSettings {
            bin_path: dir.join("missing-xray"),
            config_path: dir.join("etc/config.json"),
            auto_restart: true,
            restart_max_attempts: 5,
            stop_grace: STOP_GRACE,
            stable_after: STABLE_AFTER,
        })
    }

    #[test]
    fn backoff_doubles_then_caps_at_thirty_seconds() {
        let delays: Vec<u64> = (0..7).map(|n| backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn intentional_stop_does_not_restart() {
        let mut rt = running(1);
        rt.stop_requested = true;
        assert_eq!(rt.on_exit(1, "signal: 15", POLICY), ExitAction::Stay);
        assert_eq!(rt.phase, ProcessPhase::Stopped);
        assert!(rt.last_error.is_none());
        assert!(!rt.stop_requested);
    }

    #[test]
    fn crash_schedules_restart_with_growing_delay() {
        let mut rt = running(1);
        assert_eq!(rt.on_exit(1, "exit status: 1", POLICY), ExitAction::Restart { delay: Duration::from_secs(1) });
        assert_eq!(rt.phase, ProcessPhase::Crashed);
        assert_eq!(rt.restart_attempts, 1);
        assert!(rt.pid.is_none());

        rt.phase = ProcessPhase::Running;
        rt.generation = 2;
        assert_eq!(rt.on_exit(2, "exit status: 1", POLICY), ExitAction::Restart { delay: Duration::from_secs(2) });
        assert_eq!(rt.restart_attempts, 2);
    }

    #[test]
    fn exhausted_budget_leaves_process_stopped_with_visible_error() {
        let mut rt = running(3);
        rt.restart_attempts = POLICY.max_attempts;
        assert_eq!(rt.on_exit(3, "exit status: 23", POLICY), ExitAction::Stay);
        assert_eq!(rt.phase, ProcessPhase::Stopped);
        let status = rt.status();
        assert!(!status.running);
        assert!(status.last_error.unwrap().contains("giving up after 5 restart attempts"));
    }

    #[test]
    fn a_child_that_stayed_up_earns_back_its_budget() {
        let mut rt = running(4);
        rt.restart_attempts = POLICY.max_attempts;
        rt.started_at = Instant::now().checked_sub(STABLE_AFTER + Duration::from_secs(1));
        assert_eq!(rt.on_exit(4, "signal: 9", POLICY), ExitAction::Restart { delay: Duration::from_secs(1) });
        assert_eq!(rt.phase, ProcessPhase::Crashed);
        assert_eq!(rt.restart_attempts, 1);
    }

    #[test]
    fn disabled_auto_restart_surfaces_error() {
        let mut rt = running(1);
        let policy = RestartPolicy { enabled: false, ..POLICY };
        assert_eq!(rt.on_exit(1, "exit status: 1", policy), ExitAction::Stay);
        assert!(rt.last_error.unwrap().contains("auto-restart disabled"));
    }

    #[test]
    fn exit_of_an_older_child_is_ignored() {
        let mut rt = running(7);
        assert_eq!(rt.on_exit(6, "exit status: 1", POLICY), ExitAction::Stay);
        assert_eq!(rt.phase, ProcessPhase::Running);
        assert_eq!(rt.pid, Some(4242));
    }

    #[tokio::test]
    async fn stopping_a_never_started_manager_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let status = manager(dir.path()).stop().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.phase, ProcessPhase::Stopped);
        assert_eq!(status.pid, None);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure_with_placeholder_written() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, PanelError::ProcessSpawnFailed(_)));
        assert_eq!(std::fs::read_to_string(dir.path().join("etc/config.json")).unwrap(), "{}");

        let status = manager.status();
        assert!(!status.running);
        assert!(status.last_error.is_some());
    }
}
