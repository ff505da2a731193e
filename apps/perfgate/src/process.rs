use crate::error::StartupError;
use crate::types::{ExitReason, ProcessExitInfo};
use chrono::Utc;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use url::Url;

/// Caller-supplied "is the target ready" check.
pub trait ReadinessProbe: Send + Sync {
    fn ready(&self) -> impl Future<Output = bool> + Send;
}

/// GET a health URL; any 2xx within two seconds counts as ready.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpReadinessProbe {
    pub fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

impl ReadinessProbe for HttpReadinessProbe {
    async fn ready(&self) -> bool {
        let resp = self
            .client
            .get(self.url.clone())
            .timeout(Duration::from_secs(2))
            .send()
            .await;
        match resp {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Pid(u32),
    Endpoint(Url),
}

/// A target the harness either launched (owned) or merely watches (attached).
///
/// Owned children are spawned with `kill_on_drop`, so dropping a handle on an
/// unwinding path still takes the process down.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    child: Option<Child>,
    owned: bool,
    exit: Option<ProcessExitInfo>,
}

impl ProcessHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn exit_info(&self) -> Option<&ProcessExitInfo> {
        self.exit.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessController {
    poll_interval: Duration,
    log_path: Option<PathBuf>,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            log_path: None,
        }
    }
}

impl ProcessController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the child's stdout to `path` instead of discarding it.
    pub fn with_log(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Launch `command` through `sh` and wait for `probe` to report ready.
    pub async fn start<P: ReadinessProbe>(
        &self,
        command: &str,
        probe: &P,
        startup_timeout: Duration,
    ) -> Result<ProcessHandle, StartupError> {
        let mut handle = self.spawn(command)?;
        self.wait_ready(&mut handle, probe, startup_timeout).await?;
        Ok(handle)
    }

    /// Launch `command` through `sh` without waiting for readiness.
    pub fn spawn(&self, command: &str) -> Result<ProcessHandle, StartupError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec {command}"))
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        match &self.log_path {
            Some(path) => {
                let file = open_append(path).map_err(|err| {
                    StartupError::new(format!("failed to open {}: {err}", path.display()))
                })?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .map_err(|err| StartupError::new(format!("failed to spawn {command:?}: {err}")))?;
        let pid = child.id();
        tracing::info!(command, pid = ?pid, "spawned target process");

        Ok(ProcessHandle {
            label: command.to_string(),
            pid,
            child: Some(child),
            owned: true,
            exit: None,
        })
    }

    /// Wrap an externally managed process or endpoint. `stop` never signals it.
    pub fn attach(&self, target: AttachTarget) -> Result<ProcessHandle, StartupError> {
        match target {
            AttachTarget::Pid(pid) => {
                if pid == 0 || i32::try_from(pid).is_err() {
                    return Err(StartupError::new(format!("{pid} is not a valid process id")));
                }
                if !pid_alive(pid) {
                    return Err(StartupError::new(format!("process {pid} is not running")));
                }
                tracing::info!(pid, "attached to running process");
                Ok(ProcessHandle {
                    label: format!("pid {pid}"),
                    pid: Some(pid),
                    child: None,
                    owned: false,
                    exit: None,
                })
            }
            AttachTarget::Endpoint(url) => {
                tracing::info!(url = %url, "attached to endpoint");
                Ok(ProcessHandle {
                    label: url.to_string(),
                    pid: None,
                    child: None,
                    owned: false,
                    exit: None,
                })
            }
        }
    }

    /// Poll `probe` until it succeeds. On timeout an owned child is killed.
    pub async fn wait_ready<P: ReadinessProbe>(
        &self,
        handle: &mut ProcessHandle,
        probe: &P,
        startup_timeout: Duration,
    ) -> Result<(), StartupError> {
        let started = Instant::now();
        let deadline = started + startup_timeout;
        loop {
            if !self.is_alive(handle) {
                let exit = handle.exit.clone().unwrap_or_else(|| ProcessExitInfo {
                    pid: handle.pid,
                    code: None,
                    signal: None,
                    reason: ExitReason::StartupFailed,
                    at: Utc::now(),
                });
                let exit = ProcessExitInfo {
                    reason: ExitReason::StartupFailed,
                    ..exit
                };
                handle.exit = Some(exit.clone());
                tracing::warn!(process = handle.label(), "target exited during startup");
                return Err(StartupError::exited_during_startup(exit));
            }

            if let Ok(true) = tokio::time::timeout_at(deadline, probe.ready()).await {
                tracing::info!(
                    process = handle.label(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "target ready"
                );
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    process = handle.label(),
                    timeout_ms = startup_timeout.as_millis() as u64,
                    "target not ready before startup timeout"
                );
                let exit = self.kill_now(handle).await;
                return Err(StartupError::readiness_timeout(exit));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Safe to call repeatedly. A no-op for attached handles.
    pub async fn stop(&self, handle: &mut ProcessHandle, grace: Duration) -> Option<ProcessExitInfo> {
        if !handle.owned {
            return handle.exit.clone();
        }
        let Some(mut child) = handle.child.take() else {
            return handle.exit.clone();
        };

        if let Ok(Some(status)) = child.try_wait() {
            let exit = exit_info(handle.pid, status, ExitReason::Died);
            handle.exit = Some(exit.clone());
            return Some(exit);
        }

        if let Some(pid) = handle.pid {
            terminate(pid);
        }
        let status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                tracing::warn!(process = handle.label(), error = %err, "failed waiting for target");
                None
            }
            Err(_) => {
                tracing::warn!(
                    process = handle.label(),
                    grace_ms = grace.as_millis() as u64,
                    "target ignored SIGTERM; killing"
                );
                if let Err(err) = child.kill().await {
                    tracing::warn!(process = handle.label(), error = %err, "failed to kill target");
                }
                child.wait().await.ok()
            }
        };

        let exit = match status {
            Some(status) => exit_info(handle.pid, status, ExitReason::Stopped),
            None => ProcessExitInfo {
                pid: handle.pid,
                code: None,
                signal: None,
                reason: ExitReason::Stopped,
                at: Utc::now(),
            },
        };
        tracing::info!(process = handle.label(), exit = %exit, "target stopped");
        handle.exit = Some(exit.clone());
        Some(exit)
    }

    /// Non-blocking liveness check. Records exit info the first time death is seen.
    pub fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        if handle.exit.is_some() {
            return false;
        }
        let polled = handle.child.as_mut().map(|child| child.try_wait());
        match polled {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                handle.exit = Some(exit_info(handle.pid, status, ExitReason::Died));
                handle.child = None;
                false
            }
            Some(Err(err)) => {
                tracing::warn!(process = handle.label(), error = %err, "liveness check failed");
                true
            }
            None if handle.owned => false,
            None => match handle.pid {
                Some(pid) => {
                    let alive = pid_alive(pid);
                    if !alive {
                        handle.exit = Some(ProcessExitInfo {
                            pid: Some(pid),
                            code: None,
                            signal: None,
                            reason: ExitReason::Died,
                            at: Utc::now(),
                        });
                    }
                    alive
                }
                None => true,
            },
        }
    }

    async fn kill_now(&self, handle: &mut ProcessHandle) -> Option<ProcessExitInfo> {
        if !handle.owned {
            return None;
        }
        let mut child = handle.child.take()?;
        if let Err(err) = child.kill().await {
            tracing::warn!(process = handle.label(), error = %err, "failed to kill target");
        }
        let exit = match child.wait().await {
            Ok(status) => exit_info(handle.pid, status, ExitReason::StartupFailed),
            Err(_) => ProcessExitInfo {
                pid: handle.pid,
                code: None,
                signal: None,
                reason: ExitReason::StartupFailed,
                at: Utc::now(),
            },
        };
        handle.exit = Some(exit.clone());
        Some(exit)
    }
}

fn exit_info(pid: Option<u32>, status: ExitStatus, reason: ExitReason) -> ProcessExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExitInfo {
        pid,
        code: status.code(),
        signal,
        reason,
        at: Utc::now(),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Out-of-range values would wrap to negative pids, which address process groups.
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(pid).is_some()
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct Fixed(bool);

    impl ReadinessProbe for Fixed {
        async fn ready(&self) -> bool {
            self.0
        }
    }

    fn controller() -> ProcessController {
        ProcessController::new().with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let controller = controller();
        let mut handle = controller
            .start("sleep 30", &Fixed(true), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(controller.is_alive(&mut handle));

        let first = controller
            .stop(&mut handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(first.reason, ExitReason::Stopped);
        assert_eq!(first.signal, Some(libc::SIGTERM));
        assert!(!controller.is_alive(&mut handle));

        let second = controller
            .stop(&mut handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(second, first);
        assert!(!controller.is_alive(&mut handle));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let controller = controller();
        let mut handle = controller
            .start(
                "sh -c 'trap \"\" TERM; sleep 30'",
                &Fixed(true),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let exit = controller
            .stop(&mut handle, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn readiness_timeout_kills_the_child() {
        let controller = controller();
        let err = controller
            .start("sleep 30", &Fixed(false), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.reason, "readiness timeout");
        let exit = err.exit.unwrap();
        assert_eq!(exit.reason, ExitReason::StartupFailed);
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn early_exit_is_reported() {
        let controller = controller();
        let err = controller
            .start("sh -c 'exit 3'", &Fixed(false), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.reason, "process exited during startup");
        assert_eq!(err.exit.unwrap().code, Some(3));
    }

    #[tokio::test]
    async fn watchdog_sees_child_death() {
        let controller = controller();
        let mut handle = controller
            .start("sleep 0.2", &Fixed(true), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!controller.is_alive(&mut handle));
        let exit = handle.exit_info().unwrap();
        assert_eq!(exit.reason, ExitReason::Died);
        assert_eq!(exit.code, Some(0));

        let after_stop = controller
            .stop(&mut handle, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(after_stop.reason, ExitReason::Died);
    }

    #[tokio::test]
    async fn attached_handles_are_never_stopped() {
        let controller = controller();
        let mut handle = controller
            .attach(AttachTarget::Pid(std::process::id()))
            .unwrap();
        assert!(!handle.is_owned());
        assert!(controller.is_alive(&mut handle));
        assert!(controller
            .stop(&mut handle, Duration::from_millis(10))
            .await
            .is_none());
        assert!(controller.is_alive(&mut handle));
    }

    #[test]
    fn attach_rejects_out_of_range_pids() {
        let controller = ProcessController::new();
        for pid in [0, u32::MAX, i32::MAX as u32 + 1] {
            let err = controller.attach(AttachTarget::Pid(pid)).unwrap_err();
            assert!(err.reason.contains("not a valid process id"), "{}", err.reason);
        }
        assert!(!pid_alive(u32::MAX));
    }

    #[tokio::test]
    async fn spawned_child_can_be_stopped_before_ready() {
        let controller = controller();
        let mut handle = controller.spawn("sleep 30").unwrap();
        let pid = handle.pid().unwrap();
        assert!(pid_alive(pid));

        let exit = controller
            .stop(&mut handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(exit.reason, ExitReason::Stopped);
        assert!(!pid_alive(pid));
    }

    #[test]
    fn attach_rejects_missing_pid() {
        let err = ProcessController::new()
            .attach(AttachTarget::Pid(999_999_999))
            .unwrap_err();
        assert!(err.reason.contains("not running"));
    }
}
