use super::log_buffer::{LogBuffer, Stream};
use crate::bundle::ConfigBundle;
use crate::error::ProcessError;
use crate::installer::BinarySet;
use crate::state::{ProcessHandle, SupervisorState};
use chrono::Utc;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How long a stopped daemon may take to exit before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Upper bound on `nebula -version`.
pub const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

struct TrackedProcess {
    child: Child,
    handle: ProcessHandle,
}

/// Result of a single liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Nothing is being supervised.
    Idle,
    Running(ProcessHandle),
    /// The tracked daemon died; its handle has been cleared.
    Exited { pid: u32 },
}

/// Owns the nebula child process. Start, stop and reconcile are serialized.
pub struct ProcessController {
    state: Arc<SupervisorState>,
    binaries: BinarySet,
    bundle: ConfigBundle,
    tracked: Mutex<Option<TrackedProcess>>,
    log_buffer: Arc<LogBuffer>,
    stop_grace: Duration,
}

impl ProcessController {
    pub fn new(state: Arc<SupervisorState>, binaries: BinarySet, bundle: ConfigBundle) -> Self {
        Self {
            state,
            binaries,
            bundle,
            tracked: Mutex::new(None),
            log_buffer: Arc::new(LogBuffer::default()),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        &self.log_buffer
    }

    pub fn binaries(&self) -> &BinarySet {
        &self.binaries
    }

    pub async fn current(&self) -> Option<ProcessHandle> {
        self.tracked.lock().await.as_ref().map(|p| p.handle.clone())
    }

    pub async fn start(&self) -> Result<u32, ProcessError> {
        let mut tracked = self.tracked.lock().await;

        if let Some(existing) = tracked.as_mut() {
            let pid = existing.handle.pid;
            if check_alive(existing) {
                return Err(ProcessError::AlreadyRunning { pid });
            }
            *tracked = None;
            info!(pid, "Nebula daemon exited before restart");
            self.state.process_exited(pid);
        }

        if !self.bundle.check_complete() {
            warn!(missing = ?self.bundle.missing(), "Cannot start nebula: configuration files not found");
            return Err(ProcessError::ConfigMissing(self.bundle.dir().to_path_buf()));
        }
        if !self.binaries.daemon.is_file() {
            return Err(ProcessError::BinaryMissing(self.binaries.daemon.clone()));
        }

        let mut cmd = Command::new(&self.binaries.daemon);
        cmd.arg("-config")
            .arg(self.bundle.config_file())
            .current_dir(self.bundle.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to start nebula daemon: {}", e);
            ProcessError::Spawn(e)
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Spawn(io::Error::other("process exited before it was tracked")))?;

        self.log_buffer.clear();
        spawn_log_readers(&mut child, &self.log_buffer);

        let handle = ProcessHandle {
            pid,
            started_at: Utc::now(),
        };
        *tracked = Some(TrackedProcess {
            child,
            handle: handle.clone(),
        });
        self.state.process_started(handle);

        info!(pid, "Nebula daemon started");
        Ok(pid)
    }

    /// Sends SIGTERM and stops supervising immediately.
    ///
    /// The exit is awaited in the background; after the grace period the
    /// process is killed. A signal that could not be delivered comes back as
    /// [`ProcessError::StopWarning`] with the handle already cleared.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut tracked = self.tracked.lock().await;
        let Some(mut process) = tracked.take() else {
            return Err(ProcessError::NotRunning);
        };
        let pid = process.handle.pid;
        self.state.process_stopped(pid);

        info!(pid, "Stopping nebula daemon");
        let result = terminate(&mut process.child, pid);
        if let Err(e) = &result {
            warn!("{}", e);
        }

        let grace = self.stop_grace;
        tokio::spawn(reap(process.child, pid, grace));
        result
    }

    /// Like [`stop`](Self::stop) but waits up to `timeout` for the exit,
    /// killing the process if it is still alive afterwards.
    pub async fn stop_and_wait(&self, timeout: Duration) -> Result<(), ProcessError> {
        let mut process = {
            let mut tracked = self.tracked.lock().await;
            tracked.take().ok_or(ProcessError::NotRunning)?
        };
        let pid = process.handle.pid;
        self.state.process_stopped(pid);

        info!(pid, ?timeout, "Stopping nebula daemon and waiting for exit");
        let result = terminate(&mut process.child, pid);

        match tokio::time::timeout(timeout, process.child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "Nebula daemon exited"),
            Ok(Err(e)) => warn!(pid, "Failed waiting for nebula to exit: {}", e),
            Err(_) => {
                warn!(pid, "Nebula did not stop in time, force killing");
                if let Err(e) = process.child.kill().await {
                    warn!(pid, "Failed to kill nebula: {}", e);
                }
            }
        }

        result
    }

    /// Clears the handle if the tracked daemon is no longer alive.
    pub async fn reconcile(&self) -> Reconciled {
        let mut tracked = self.tracked.lock().await;
        let Some(process) = tracked.as_mut() else {
            return Reconciled::Idle;
        };

        if check_alive(process) {
            debug!(pid = process.handle.pid, "Nebula daemon is healthy");
            return Reconciled::Running(process.handle.clone());
        }

        let pid = process.handle.pid;
        *tracked = None;
        info!(pid, "Nebula daemon has stopped unexpectedly");
        self.state.process_exited(pid);
        Reconciled::Exited { pid }
    }
}

fn check_alive(process: &mut TrackedProcess) -> bool {
    match process.child.try_wait() {
        Ok(Some(status)) => {
            debug!(pid = process.handle.pid, %status, "Nebula daemon exited");
            false
        }
        Ok(None) => true,
        Err(e) => {
            warn!(pid = process.handle.pid, "Error checking nebula status: {}", e);
            is_process_running(process.handle.pid)
        }
    }
}

fn terminate(child: &mut Child, pid: u32) -> Result<(), ProcessError> {
    if let Ok(Some(status)) = child.try_wait() {
        return Err(ProcessError::StopWarning {
            pid,
            reason: format!("process already exited ({})", status),
        });
    }

    #[cfg(unix)]
    {
        // The child is unreaped, so `pid` cannot have been recycled.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(ProcessError::StopWarning {
                pid,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        child.start_kill().map_err(|e| ProcessError::StopWarning {
            pid,
            reason: e.to_string(),
        })
    }
}

async fn reap(mut child: Child, pid: u32, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "Nebula daemon exited"),
        Ok(Err(e)) => warn!(pid, "Failed waiting for nebula to exit: {}", e),
        Err(_) => {
            warn!(pid, "Nebula did not stop in time, force killing");
            if let Err(e) = child.kill().await {
                warn!(pid, "Failed to kill nebula: {}", e);
            }
        }
    }
}

#[cfg(unix)]
pub(crate) fn is_process_running(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn is_process_running(_pid: u32) -> bool {
    true
}

/// Mirrors nebula's stdout/stderr into the log buffer and the `nebula` tracing target.
fn spawn_log_readers(child: &mut Child, log_buffer: &Arc<LogBuffer>) {
    if let Some(stdout) = child.stdout.take() {
        let buf = Arc::clone(log_buffer);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "nebula", "{}", line);
                buf.push(Stream::Stdout, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let buf = Arc::clone(log_buffer);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "nebula", "{}", line);
                buf.push(Stream::Stderr, line);
            }
        });
    }
}

/// Runs `nebula -version`.
pub async fn daemon_version(binaries: &BinarySet) -> Result<String, ProcessError> {
    if !binaries.daemon.is_file() {
        return Err(ProcessError::BinaryMissing(binaries.daemon.clone()));
    }

    let mut cmd = Command::new(&binaries.daemon);
    cmd.arg("-version").kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ProcessError::Version(format!("no answer within {:?}", VERSION_TIMEOUT)))?
        .map_err(|e| ProcessError::Version(e.to_string()))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(ProcessError::Version(format!(
            "{}: {}",
            output.status,
            text.trim()
        )));
    }
    Ok(text.trim().to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bundle::BUNDLE_FILES;
    use crate::state::StateEvent;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        bundle: ConfigBundle,
        binaries: BinarySet,
        state: Arc<SupervisorState>,
    }

    impl Fixture {
        fn new(daemon_script: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bundle_dir = dir.path().join("nebula");
            let bin_dir = dir.path().join("bin");
            fs::create_dir_all(&bundle_dir).unwrap();
            fs::create_dir_all(&bin_dir).unwrap();
            for name in BUNDLE_FILES {
                fs::write(bundle_dir.join(name), name).unwrap();
            }

            let binaries = BinarySet::in_dir(&bin_dir);
            write_script(&binaries.daemon, daemon_script);

            Self {
                _dir: dir,
                bundle: ConfigBundle::new(bundle_dir),
                binaries,
                state: Arc::new(SupervisorState::new()),
            }
        }

        fn controller(&self) -> ProcessController {
            ProcessController::new(
                Arc::clone(&self.state),
                self.binaries.clone(),
                self.bundle.clone(),
            )
            .with_stop_grace(Duration::from_secs(2))
        }
    }

    fn write_script(path: &Path, body: &str) {
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn wait_for_exit(controller: &ProcessController) -> Reconciled {
        for _ in 0..100 {
            match controller.reconcile().await {
                Reconciled::Running(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                other => return other,
            }
        }
        panic!("daemon never exited");
    }

    #[tokio::test]
    async fn test_start_requires_config() {
        let fx = Fixture::new("exec sleep 30");
        fs::remove_file(fx.bundle.host_cert()).unwrap();

        let err = fx.controller().start().await.unwrap_err();
        assert!(matches!(err, ProcessError::ConfigMissing(_)));
        assert!(!fx.state.snapshot().is_running());
    }

    #[tokio::test]
    async fn test_start_requires_binary() {
        let fx = Fixture::new("exec sleep 30");
        fs::remove_file(&fx.binaries.daemon).unwrap();

        let err = fx.controller().start().await.unwrap_err();
        assert!(matches!(err, ProcessError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn test_start_then_reconcile_reports_running() {
        let fx = Fixture::new("exec sleep 30");
        let controller = fx.controller();

        let pid = controller.start().await.unwrap();
        assert_eq!(fx.state.process().map(|p| p.pid), Some(pid));

        match controller.reconcile().await {
            Reconciled::Running(handle) => assert_eq!(handle.pid, pid),
            other => panic!("expected running, got {other:?}"),
        }

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning { pid: p } if p == pid));

        controller.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_external_kill_detected_once() {
        let fx = Fixture::new("exec sleep 30");
        let controller = fx.controller();
        let pid = controller.start().await.unwrap();
        let mut events = fx.state.subscribe();

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }

        assert_eq!(wait_for_exit(&controller).await, Reconciled::Exited { pid });
        assert_eq!(controller.reconcile().await, Reconciled::Idle);
        assert!(fx.state.process().is_none());

        let mut exited = 0;
        while let Ok(event) = events.try_recv() {
            if event == (StateEvent::ProcessExited { pid }) {
                exited += 1;
            }
        }
        assert_eq!(exited, 1);
    }

    #[tokio::test]
    async fn test_stop_then_start_tracks_one_process() {
        let fx = Fixture::new("exec sleep 30");
        let controller = fx.controller();

        let first = controller.start().await.unwrap();
        controller.stop().await.unwrap();
        let second = controller.start().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(controller.current().await.map(|h| h.pid), Some(second));
        assert_eq!(fx.state.process().map(|h| h.pid), Some(second));

        // The first daemon is reaped in the background.
        for _ in 0..100 {
            if !is_process_running(first) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!is_process_running(first));

        controller.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_stop_and_start() {
        let fx = Fixture::new("exec sleep 30");
        let controller = fx.controller();
        controller.start().await.unwrap();

        let (stopped, started) = tokio::join!(controller.stop(), controller.start());
        stopped.unwrap();
        // Start observed the old daemon or ran after the stop.
        match started {
            Ok(pid) => assert_eq!(controller.current().await.map(|h| h.pid), Some(pid)),
            Err(ProcessError::AlreadyRunning { .. }) => assert!(controller.current().await.is_none()),
            Err(e) => panic!("unexpected error: {e}"),
        }

        let _ = controller.stop_and_wait(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let fx = Fixture::new("exec sleep 30");
        let err = fx.controller().stop().await.unwrap_err();
        assert!(matches!(err, ProcessError::NotRunning));
    }

    #[tokio::test]
    async fn test_stop_after_exit_is_warning() {
        let fx = Fixture::new("exit 0");
        let controller = fx.controller();
        controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = controller.stop().await.unwrap_err();
        assert!(err.is_warning());
        assert!(fx.state.process().is_none());
        assert!(controller.current().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_and_wait_kills_stubborn_daemon() {
        let fx = Fixture::new("trap '' TERM\nwhile true; do sleep 1; done");
        let controller = fx.controller();
        let pid = controller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        controller
            .stop_and_wait(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!is_process_running(pid));
    }

    #[tokio::test]
    async fn test_output_is_captured() {
        let fx = Fixture::new("echo hello from nebula\nexec sleep 30");
        let controller = fx.controller();
        controller.start().await.unwrap();

        let mut captured = Vec::new();
        for _ in 0..100 {
            captured = controller.log_buffer().tail(10);
            if !captured.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(captured, vec!["[stdout] hello from nebula"]);

        controller.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_discards_previous_output() {
        let fx = Fixture::new("echo run-$$\nexec sleep 30");
        let controller = fx.controller();

        let first = controller.start().await.unwrap();
        wait_for_output(&controller, &format!("[stdout] run-{first}")).await;
        controller.stop_and_wait(Duration::from_secs(2)).await.unwrap();

        let second = controller.start().await.unwrap();
        wait_for_output(&controller, &format!("[stdout] run-{second}")).await;
        assert_eq!(controller.log_buffer().tail(10), vec![format!("[stdout] run-{second}")]);

        controller.stop_and_wait(Duration::from_secs(2)).await.unwrap();
    }

    async fn wait_for_output(controller: &ProcessController, line: &str) {
        for _ in 0..100 {
            if controller.log_buffer().tail(10).iter().any(|l| l == line) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("never saw {line:?}");
    }

    #[tokio::test]
    async fn test_daemon_version() {
        let fx = Fixture::new("echo 'Version: 1.9.3'");
        assert_eq!(daemon_version(&fx.binaries).await.unwrap(), "Version: 1.9.3");
    }
}
