//! Host-side capability servers (browser automation, iOS simulator,
//! clipboard) that drones call from inside their containers.

pub mod kind;
pub mod process;
pub mod protocol;
pub mod restart;

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::{HostMcpConfig, HostMcpsConfig};
use self::process::Signal;

pub use kind::{CapabilityKind, LaunchSpec, ScriptLocator};
pub use protocol::{CapabilityClient, ProtocolError, ToolResult};
pub use restart::{supervise, ExitKind, RestartPolicy, SupervisionOutcome};

pub const STARTUP_GRACE: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);
const FAILURE_LOG_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{kind} capability server is only available on macOS")]
    Unsupported { kind: CapabilityKind },
    #[error("Port {0} is still in use after cleanup")]
    PortBusy(u16),
    #[error("{0} not found; is hive installed correctly?")]
    ScriptNotFound(&'static str),
    #[error("Failed to launch {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{kind} exited during startup. Check logs:\n{logs}")]
    Exited { kind: CapabilityKind, logs: String },
    #[error("{0}")]
    Prerequisite(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{}", .0.join("; "))]
    Batch(Vec<String>),
}

/// A running capability server.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub name: CapabilityKind,
    pub pid: u32,
    pub port: u16,
    pub command: String,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub kind: CapabilityKind,
    pub enabled: bool,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub port: u16,
}

struct Tracked {
    record: ProcessRecord,
    child: Child,
}

/// Starts and stops capability servers, keeping a PID file and a log file per
/// kind under the hive directory. Servers started by an earlier process are
/// found again through their PID files. Dropping the supervisor terminates
/// the servers it started.
pub struct HostProcessSupervisor {
    pids_dir: PathBuf,
    logs_dir: PathBuf,
    scripts: ScriptLocator,
    grace: Duration,
    processes: Mutex<HashMap<CapabilityKind, Tracked>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl HostProcessSupervisor {
    /// `hive_dir` is the project's `.hive` control directory.
    pub fn new(hive_dir: impl AsRef<Path>) -> Self {
        let hive_dir = hive_dir.as_ref();
        let project_dir = hive_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_scripts(hive_dir, ScriptLocator::new(project_dir))
    }

    pub fn with_scripts(hive_dir: impl AsRef<Path>, scripts: ScriptLocator) -> Self {
        let hive_dir = hive_dir.as_ref();
        Self {
            pids_dir: hive_dir.join("pids"),
            logs_dir: hive_dir.join("logs"),
            scripts,
            grace: STARTUP_GRACE,
            processes: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn pid_file(&self, kind: CapabilityKind) -> PathBuf {
        self.pids_dir.join(format!("{}.pid", kind))
    }

    pub fn log_file(&self, kind: CapabilityKind) -> PathBuf {
        self.logs_dir.join(format!("{}.log", kind))
    }

    fn ensure_dirs(&self) -> Result<(), SupervisorError> {
        std::fs::create_dir_all(&self.pids_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }

    /// Frees the port, launches the server and checks it survives the grace
    /// period. Unsupported kinds fail before anything is touched.
    pub async fn start(&self, kind: CapabilityKind, config: &HostMcpConfig) -> Result<ProcessRecord, SupervisorError> {
        kind.ensure_supported()?;
        let port = config.port.unwrap_or_else(|| kind.default_port());
        if kind == CapabilityKind::Ios {
            check_simulator_tools().await?;
        }
        let launch = kind.launch(config, port, &self.scripts)?;
        self.start_with(kind, port, launch).await
    }

    pub(crate) async fn start_with(
        &self,
        kind: CapabilityKind,
        port: u16,
        launch: LaunchSpec,
    ) -> Result<ProcessRecord, SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_dirs()?;
        self.ensure_port_free(kind, port).await?;

        let log_path = self.log_file(kind);
        let log = File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| SupervisorError::Launch {
            name: kind.to_string(),
            source: e,
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Exited {
                kind,
                logs: process::tail(&log_path, FAILURE_LOG_LINES).unwrap_or_default(),
            });
        };
        if let Err(e) = std::fs::write(self.pid_file(kind), pid.to_string()) {
            let _ = child.kill().await;
            return Err(e.into());
        }

        tokio::time::sleep(self.grace).await;
        if let Ok(Some(status)) = child.try_wait() {
            self.remove_pid_file(kind);
            tracing::error!("{} exited during startup ({})", kind, status);
            return Err(SupervisorError::Exited {
                kind,
                logs: process::tail(&log_path, FAILURE_LOG_LINES).unwrap_or_default(),
            });
        }

        let record = ProcessRecord {
            name: kind,
            pid,
            port,
            command: launch.program,
            args: launch.args,
            log_path,
            started_at: Utc::now(),
        };
        tracing::info!("Started {} on port {} (PID {})", kind, port, pid);
        self.processes.lock().insert(
            kind,
            Tracked {
                record: record.clone(),
                child,
            },
        );
        Ok(record)
    }

    async fn ensure_port_free(&self, kind: CapabilityKind, port: u16) -> Result<(), SupervisorError> {
        self.stop_locked(kind).await?;
        if process::is_port_available(port) {
            return Ok(());
        }
        tracing::warn!("Port {} is busy; terminating its listeners", port);
        process::kill_listeners(port).await;
        if process::is_port_available(port) {
            Ok(())
        } else {
            Err(SupervisorError::PortBusy(port))
        }
    }

    /// Stops the server of `kind`, whether this supervisor started it or an
    /// earlier process did. Stopping something that is not running is fine.
    pub async fn stop(&self, kind: CapabilityKind) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(kind).await
    }

    async fn stop_locked(&self, kind: CapabilityKind) -> Result<(), SupervisorError> {
        let tracked = self.processes.lock().remove(&kind);
        match tracked {
            Some(mut tracked) => {
                let pid = tracked.record.pid;
                request_shutdown(&mut tracked.child, pid);
                if tokio::time::timeout(STOP_TIMEOUT, tracked.child.wait()).await.is_err() {
                    tracing::warn!("{} ignored SIGTERM; killing", kind);
                    process::signal_group(pid, Signal::Kill);
                    let _ = tracked.child.kill().await;
                }
                tracing::info!("Stopped {} (PID {})", kind, pid);
            }
            None => {
                if let Some(pid) = self.read_pid(kind) {
                    if process::process_exists(pid) {
                        stop_orphan(pid).await;
                        tracing::info!("Stopped orphaned {} (PID {})", kind, pid);
                    }
                }
            }
        }
        self.remove_pid_file(kind);
        Ok(())
    }

    pub fn is_running(&self, kind: CapabilityKind) -> bool {
        self.running_pid(kind).is_some()
    }

    fn running_pid(&self, kind: CapabilityKind) -> Option<u32> {
        if let Some(tracked) = self.processes.lock().get_mut(&kind) {
            return match tracked.child.try_wait() {
                Ok(None) => Some(tracked.record.pid),
                _ => None,
            };
        }
        self.read_pid(kind).filter(|pid| process::process_exists(*pid))
    }

    pub fn record(&self, kind: CapabilityKind) -> Option<ProcessRecord> {
        self.processes.lock().get(&kind).map(|t| t.record.clone())
    }

    /// The last `lines` lines of the server's combined output.
    pub fn logs(&self, kind: CapabilityKind, lines: usize) -> Result<String, SupervisorError> {
        Ok(process::tail(&self.log_file(kind), lines)?)
    }

    pub fn status(&self, config: &HostMcpsConfig) -> Vec<ProcessStatus> {
        CapabilityKind::ALL
            .into_iter()
            .map(|kind| {
                let pid = self.running_pid(kind);
                ProcessStatus {
                    kind,
                    enabled: config.get(kind).enabled,
                    running: pid.is_some(),
                    pid,
                    port: config.port(kind),
                }
            })
            .collect()
    }

    /// Starts every enabled kind, collecting failures instead of stopping at
    /// the first one.
    pub async fn start_all(&self, config: &HostMcpsConfig) -> Result<(), SupervisorError> {
        let mut errors = Vec::new();
        for kind in config.enabled_kinds() {
            if let Err(e) = self.start(kind, config.get(kind)).await {
                tracing::error!("Failed to start {}: {}", kind, e);
                errors.push(format!("{}: {}", kind, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Batch(errors))
        }
    }

    pub async fn stop_all(&self) -> Result<(), SupervisorError> {
        let mut errors = Vec::new();
        for kind in CapabilityKind::ALL {
            if let Err(e) = self.stop(kind).await {
                errors.push(format!("{}: {}", kind, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Batch(errors))
        }
    }

    fn read_pid(&self, kind: CapabilityKind) -> Option<u32> {
        std::fs::read_to_string(self.pid_file(kind))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .filter(|pid| process::is_valid_pid(*pid))
    }

    fn remove_pid_file(&self, kind: CapabilityKind) {
        let _ = std::fs::remove_file(self.pid_file(kind));
    }
}

impl Drop for HostProcessSupervisor {
    fn drop(&mut self) {
        for (kind, mut tracked) in self.processes.lock().drain() {
            request_shutdown(&mut tracked.child, tracked.record.pid);
            let _ = std::fs::remove_file(self.pids_dir.join(format!("{}.pid", kind)));
        }
    }
}

#[cfg(unix)]
fn request_shutdown(_child: &mut Child, pid: u32) {
    process::signal_group(pid, Signal::Term);
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}

async fn stop_orphan(pid: u32) {
    process::signal_group(pid, Signal::Term);
    let polls = (STOP_TIMEOUT.as_millis() / STOP_POLL.as_millis()) as usize;
    for _ in 0..polls {
        if !process::process_exists(pid) {
            return;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
    process::signal_group(pid, Signal::Kill);
}

async fn check_simulator_tools() -> Result<(), SupervisorError> {
    let available = Command::new("xcrun")
        .args(["simctl", "help"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false);
    if available {
        Ok(())
    } else {
        Err(SupervisorError::Prerequisite(
            "xcrun simctl not available; install Xcode and its command line tools".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> HostProcessSupervisor {
        let scripts = ScriptLocator::with_dirs(dir.path(), None, None);
        HostProcessSupervisor::with_scripts(dir.path().join(".hive"), scripts)
            .with_grace_period(Duration::from_millis(200))
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_gated_kind_fails_before_touching_anything() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let err = supervisor
            .start(CapabilityKind::Ios, &HostMcpConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Unsupported { kind: CapabilityKind::Ios }));
        assert!(!dir.path().join(".hive").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stop_cycle() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let port = free_port();

        let record = supervisor
            .start_with(CapabilityKind::Playwright, port, sh("echo listening; sleep 30"))
            .await
            .unwrap();
        assert_eq!(record.port, port);
        assert!(supervisor.is_running(CapabilityKind::Playwright));
        let pid_file = supervisor.pid_file(CapabilityKind::Playwright);
        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), record.pid.to_string());
        assert!(supervisor.logs(CapabilityKind::Playwright, 5).unwrap().contains("listening"));

        supervisor.stop(CapabilityKind::Playwright).await.unwrap();
        assert!(!supervisor.is_running(CapabilityKind::Playwright));
        assert!(!pid_file.exists());
        supervisor.stop(CapabilityKind::Playwright).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reports_logs() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let err = supervisor
            .start_with(CapabilityKind::Playwright, free_port(), sh("echo boom >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            SupervisorError::Exited { kind, logs } => {
                assert_eq!(kind, CapabilityKind::Playwright);
                assert!(logs.contains("boom"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!supervisor.is_running(CapabilityKind::Playwright));
        assert!(!supervisor.pid_file(CapabilityKind::Playwright).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_busy_port_is_refused() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = supervisor
            .start_with(CapabilityKind::Playwright, port, sh("sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::PortBusy(p) if p == port));
        assert!(!supervisor.is_running(CapabilityKind::Playwright));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_replaces_previous_instance() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let port = free_port();

        let first = supervisor
            .start_with(CapabilityKind::Playwright, port, sh("sleep 30"))
            .await
            .unwrap();
        let second = supervisor
            .start_with(CapabilityKind::Playwright, port, sh("sleep 30"))
            .await
            .unwrap();
        assert_ne!(first.pid, second.pid);
        assert!(!process::process_exists(first.pid));
        supervisor.stop_all().await.unwrap();
        assert!(!supervisor.is_running(CapabilityKind::Playwright));
    }

    #[test]
    fn test_status_reports_configured_ports() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        let mut config = HostMcpsConfig::default();
        config.playwright.enabled = true;
        config.clipboard.port = Some(9999);

        let status = supervisor.status(&config);
        assert_eq!(status.len(), 3);
        assert!(status[0].enabled && !status[0].running);
        assert_eq!(status[2].port, 9999);
    }

    #[test]
    fn test_logs_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(supervisor(&dir).logs(CapabilityKind::Clipboard, 10).is_err());
    }

    #[tokio::test]
    async fn test_group_pid_in_pid_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(&dir);
        std::fs::create_dir_all(dir.path().join(".hive").join("pids")).unwrap();

        for raw in ["0", "4294967295", "not-a-pid"] {
            std::fs::write(supervisor.pid_file(CapabilityKind::Clipboard), raw).unwrap();
            assert!(!supervisor.is_running(CapabilityKind::Clipboard));
            supervisor.stop(CapabilityKind::Clipboard).await.unwrap();
            assert!(!supervisor.pid_file(CapabilityKind::Clipboard).exists());
        }
    }
}
