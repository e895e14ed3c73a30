//! Lifecycle of the single supervised game-server process.
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`, plus `Running -> Stopped` when
//! the process exits on its own. Every successful start spawns exactly three tasks: a
//! stdout drain, a stderr drain and an exit watcher. The watcher owns the `Child` and is
//! the only place the handle is cleared.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::{oneshot, watch, Mutex},
};
use tracing::{debug, error, info, warn};

use super::probe::ProcessProbe;
use crate::logs::broadcaster::LogBroadcaster;

pub const STOP_GRACE: Duration = Duration::from_secs(3);
pub const RESTART_PAUSE: Duration = Duration::from_millis(500);
/// How long to wait for the exit watcher after a forced kill.
const KILL_SETTLE: Duration = Duration::from_secs(5);
const STDERR_TAG: &str = "SERVER ERROR: ";

#[cfg(windows)]
pub const SERVER_EXECUTABLE: &str = "ArmaReforgerServer.exe";
#[cfg(not(windows))]
pub const SERVER_EXECUTABLE: &str = "ArmaReforgerServer";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("game server is already running")]
    AlreadyRunning,
    #[error("game server is not running")]
    NotRunning,
    #[error("game server process error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub work_dir: PathBuf,
}

impl LaunchSpec {
    /// Standard dedicated-server launch rooted at `server_path`.
    pub fn for_server(server_path: &Path) -> Self {
        Self {
            executable: server_path.join(SERVER_EXECUTABLE),
            args: vec![
                "-config".into(),
                server_path.join("config.json").into_os_string(),
                "-profile".into(),
                server_path.join("profile").into_os_string(),
            ],
            work_dir: server_path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub installed: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub phase: Phase,
    /// Whether this panel holds the process handle (false when only found via the process list).
    pub managed: bool,
}

struct Handle {
    pid: u32,
    generation: u64,
    exited: watch::Receiver<bool>,
    kill: Option<oneshot::Sender<()>>,
}

struct Slot {
    phase: Phase,
    handle: Option<Handle>,
    generation: u64,
}

struct Inner {
    slot: Mutex<Slot>,
    logs: LogBroadcaster,
    probe: Arc<dyn ProcessProbe>,
    grace: Duration,
    restart_pause: Duration,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(logs: LogBroadcaster, probe: Arc<dyn ProcessProbe>) -> Self {
        Self::with_timing(logs, probe, STOP_GRACE, RESTART_PAUSE)
    }

    pub fn with_timing(
        logs: LogBroadcaster,
        probe: Arc<dyn ProcessProbe>,
        grace: Duration,
        restart_pause: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    phase: Phase::Stopped,
                    handle: None,
                    generation: 0,
                }),
                logs,
                probe,
                grace,
                restart_pause,
            }),
        }
    }

    pub async fn phase(&self) -> Phase {
        self.inner.slot.lock().await.phase
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.slot.lock().await.handle.as_ref().map(|h| h.pid)
    }

    /// Spawns the process and returns its pid without waiting for it.
    pub async fn start(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.handle.is_some() || slot.phase != Phase::Stopped {
            return Err(SupervisorError::AlreadyRunning);
        }
        slot.phase = Phase::Starting;

        let mut cmd = Command::new(&launch.executable);
        cmd.args(&launch.args)
            .current_dir(&launch.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                slot.phase = Phase::Stopped;
                error!(error = %e, executable = %launch.executable.display(), "failed to spawn game server");
                return Err(e.into());
            }
        };
        let pid = child.id().unwrap_or_default();
        self.inner.logs.publish("game server starting...");

        slot.generation += 1;
        let generation = slot.generation;
        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, self.inner.logs.clone(), ""));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, self.inner.logs.clone(), STDERR_TAG));
        }
        tokio::spawn(watch_exit(
            self.inner.clone(),
            child,
            pid,
            generation,
            kill_rx,
            exited_tx,
        ));

        slot.handle = Some(Handle {
            pid,
            generation,
            exited: exited_rx,
            kill: Some(kill_tx),
        });
        slot.phase = Phase::Running;
        info!(pid, executable = %launch.executable.display(), "game server started");
        Ok(pid)
    }

    /// Graceful terminate, then kill once the grace period runs out.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (pid, generation, mut exited) = {
            let mut slot = self.inner.slot.lock().await;
            let handle = slot.handle.as_ref().ok_or(SupervisorError::NotRunning)?;
            let taken = (handle.pid, handle.generation, handle.exited.clone());
            slot.phase = Phase::Stopping;
            taken
        };

        self.inner.logs.publish("stopping game server...");
        if let Err(e) = request_terminate(pid).await {
            warn!(pid, error = %e, "graceful terminate request failed");
        }
        if wait_exited(&mut exited, self.inner.grace).await {
            info!(pid, "game server stopped gracefully");
            return Ok(());
        }

        warn!(pid, grace = ?self.inner.grace, "game server ignored terminate, killing");
        let kill = {
            let mut slot = self.inner.slot.lock().await;
            slot.handle
                .as_mut()
                .filter(|h| h.generation == generation)
                .and_then(|h| h.kill.take())
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if wait_exited(&mut exited, KILL_SETTLE).await {
            Ok(())
        } else {
            error!(pid, "game server still alive after kill");
            Err(SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "process did not exit after kill",
            )))
        }
    }

    /// Stop (if running), pause so ports and file locks are released, then start.
    pub async fn restart(&self, launch: &LaunchSpec) -> Result<u32, SupervisorError> {
        self.inner.logs.publish("restarting game server...");
        match self.stop().await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(self.inner.restart_pause).await;
        self.start(launch).await
    }

    pub async fn status(&self, launch: &LaunchSpec) -> ServerStatus {
        let installed = tokio::fs::try_exists(&launch.executable)
            .await
            .unwrap_or(false);
        let (phase, own_pid) = {
            let slot = self.inner.slot.lock().await;
            (slot.phase, slot.handle.as_ref().map(|h| h.pid))
        };
        let pid = match own_pid {
            Some(pid) => Some(pid),
            None => self.inner.probe.find(&launch.executable).await,
        };
        ServerStatus {
            installed,
            running: pid.is_some(),
            pid,
            phase,
            managed: own_pid.is_some(),
        }
    }
}

async fn drain<R>(stream: R, logs: LogBroadcaster, tag: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
                logs.publish(format!("{tag}{line}"));
            }
            Err(e) => {
                warn!(error = %e, "output stream read failed");
                break;
            }
        }
    }
    debug!(stderr = !tag.is_empty(), "output drain finished");
}

async fn watch_exit(
    inner: Arc<Inner>,
    mut child: Child,
    pid: u32,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exited: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(pid, error = %e, "kill failed");
            }
            child.wait().await
        }
    };
    match &status {
        Ok(s) => info!(pid, status = %s, "game server exited"),
        Err(e) => {
            error!(pid, error = %e, "lost track of game server process");
            let _ = child.start_kill();
        }
    }

    {
        let mut slot = inner.slot.lock().await;
        if slot.handle.as_ref().is_some_and(|h| h.generation == generation) {
            slot.handle = None;
            slot.phase = Phase::Stopped;
        }
    }
    inner.logs.publish("game server stopped.");
    let _ = exited.send(true);
}

/// `true` once the watcher reported exit within `limit`.
async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    // a dropped sender also means the watcher is done
    tokio::time::timeout(limit, exited.wait_for(|done| *done))
        .await
        .is_ok()
}

#[cfg(unix)]
async fn request_terminate(pid: u32) -> std::io::Result<()> {
    if pid == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "unknown pid",
        ));
    }
    // SAFETY: kill(2) with a concrete positive pid has no memory-safety requirements.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
async fn request_terminate(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/T", "/PID", &pid.to_string()])
        .creation_flags(0x0800_0000)
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{logs::broadcaster::Subscription, server::probe::NoProbe};
    use std::time::Instant;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            work_dir: std::env::temp_dir(),
        }
    }

    fn supervisor(logs: &LogBroadcaster, grace: Duration) -> Supervisor {
        Supervisor::with_timing(logs.clone(), Arc::new(NoProbe), grace, Duration::from_millis(50))
    }

    async fn wait_for_lines(sub: &mut Subscription, wanted: &[&str]) {
        let mut missing: Vec<&str> = wanted.to_vec();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(line) = sub.recv().await {
                missing.retain(|w| *w != line.text);
                if missing.is_empty() {
                    return;
                }
            }
            panic!("log stream closed early");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
    }

    #[tokio::test]
    async fn output_is_streamed_and_exit_clears_handle() {
        let logs = LogBroadcaster::default();
        let mut sub = logs.subscribe();
        let sup = supervisor(&logs, STOP_GRACE);

        let pid = sup.start(&sh("echo hello; echo oops 1>&2")).await.unwrap();
        assert!(pid > 0);
        wait_for_lines(&mut sub, &["hello", "SERVER ERROR: oops", "game server stopped."]).await;

        let texts: Vec<String> = logs.snapshot().into_iter().map(|l| l.text).collect();
        assert_eq!(texts.first().map(String::as_str), Some("game server starting..."));
        assert!(texts.contains(&"hello".to_string()));
        assert!(texts.contains(&"SERVER ERROR: oops".to_string()));

        assert_eq!(sup.phase().await, Phase::Stopped);
        assert_eq!(sup.pid().await, None);
        assert!(matches!(sup.stop().await, Err(SupervisorError::NotRunning)));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let logs = LogBroadcaster::default();
        let sup = supervisor(&logs, STOP_GRACE);
        let launch = sh("exec sleep 30");

        let pid = sup.start(&launch).await.unwrap();
        assert!(matches!(
            sup.start(&launch).await,
            Err(SupervisorError::AlreadyRunning)
        ));
        assert_eq!(sup.pid().await, Some(pid));

        sup.stop().await.unwrap();
        assert_eq!(sup.pid().await, None);
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let logs = LogBroadcaster::default();
        let sup = supervisor(&logs, STOP_GRACE);
        let launch = sh("exec sleep 30");

        let (a, b) = tokio::join!(sup.start(&launch), sup.start(&launch));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_graceful_when_process_cooperates() {
        let logs = LogBroadcaster::default();
        let sup = supervisor(&logs, STOP_GRACE);
        sup.start(&sh("exec sleep 30")).await.unwrap();

        let started = Instant::now();
        sup.stop().await.unwrap();
        assert!(started.elapsed() < STOP_GRACE);
        assert_eq!(sup.phase().await, Phase::Stopped);
    }

    #[tokio::test]
    async fn stop_kills_process_ignoring_terminate() {
        let logs = LogBroadcaster::default();
        let mut sub = logs.subscribe();
        let grace = Duration::from_millis(300);
        let sup = supervisor(&logs, grace);
        sup.start(&sh("trap '' TERM; echo ready; exec sleep 30"))
            .await
            .unwrap();
        wait_for_lines(&mut sub, &["ready"]).await;

        let started = Instant::now();
        sup.stop().await.unwrap();
        let took = started.elapsed();
        assert!(took >= grace, "stopped after {took:?}");
        assert!(took < grace + KILL_SETTLE);
        assert_eq!(sup.pid().await, None);
        assert_eq!(sup.phase().await, Phase::Stopped);
    }

    #[tokio::test]
    async fn restart_replaces_process_and_tolerates_stopped() {
        let logs = LogBroadcaster::default();
        let sup = supervisor(&logs, STOP_GRACE);
        let launch = sh("exec sleep 30");

        let first = sup.restart(&launch).await.unwrap();
        let second = sup.restart(&launch).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(sup.pid().await, Some(second));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_leaves_supervisor_stopped() {
        let logs = LogBroadcaster::default();
        let sup = supervisor(&logs, STOP_GRACE);
        let missing = LaunchSpec {
            executable: PathBuf::from("/definitely/not/here"),
            args: vec![],
            work_dir: std::env::temp_dir(),
        };
        assert!(matches!(sup.start(&missing).await, Err(SupervisorError::Io(_))));
        assert_eq!(sup.phase().await, Phase::Stopped);

        sup.start(&sh("exec sleep 30")).await.unwrap();
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_install_and_handle() {
        let logs = LogBroadcaster::default();
        let sup = supervisor(&logs, STOP_GRACE);
        let launch = sh("exec sleep 30");

        let idle = sup.status(&launch).await;
        assert!(idle.installed);
        assert!(!idle.running);
        assert_eq!(idle.pid, None);

        let pid = sup.start(&launch).await.unwrap();
        let live = sup.status(&launch).await;
        assert!(live.running && live.managed);
        assert_eq!(live.pid, Some(pid));
        assert_eq!(live.phase, Phase::Running);
        sup.stop().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let absent = sup.status(&LaunchSpec::for_server(dir.path())).await;
        assert!(!absent.installed);
    }

    #[tokio::test]
    async fn status_falls_back_to_process_probe() {
        struct Found;
        #[async_trait::async_trait]
        impl ProcessProbe for Found {
            async fn find(&self, executable: &Path) -> Option<u32> {
                executable.ends_with(SERVER_EXECUTABLE).then_some(4242)
            }
        }

        let sup = Supervisor::new(LogBroadcaster::default(), Arc::new(Found));
        let dir = tempfile::tempdir().unwrap();
        let status = sup.status(&LaunchSpec::for_server(dir.path())).await;
        assert!(status.running);
        assert!(!status.managed);
        assert_eq!(status.pid, Some(4242));
    }

    #[test]
    fn launch_spec_for_server_layout() {
        let launch = LaunchSpec::for_server(Path::new("/srv/reforger"));
        assert_eq!(launch.executable, PathBuf::from("/srv/reforger/ArmaReforgerServer"));
        assert_eq!(launch.args[0], "-config");
        assert_eq!(launch.args[1], "/srv/reforger/config.json");
        assert_eq!(launch.args[3], "/srv/reforger/profile");
        assert_eq!(launch.work_dir, PathBuf::from("/srv/reforger"));
    }
}
