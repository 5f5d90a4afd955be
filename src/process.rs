//! Discovery, graceful stop and launch of the served application process.

use crate::config::AppConfig;
use crate::core::{Result, StockError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Lifecycle operations the update orchestrator needs from the service.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// First process whose command line references the service entry point.
    async fn find_target_process(&self) -> Option<i32>;

    /// SIGTERM, wait up to `timeout`, then SIGKILL. A process that is already
    /// gone counts as stopped.
    async fn stop_gracefully(&self, pid: i32, timeout: Duration) -> Result<()>;

    /// Starts the service and returns its pid once it survived the grace period.
    async fn launch_service(&self) -> Result<i32>;
}

/// Whether `pid` names a live, non-zombie process.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name may contain spaces and parentheses; the state field
    // follows the last ')'.
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

fn read_cmdline(proc_dir: &Path) -> Option<String> {
    let raw = fs::read(proc_dir.join("cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    let parts: Vec<String> = raw
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    Some(parts.join(" "))
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(EXIT_POLL).await;
    }
}

pub struct ProcessManager {
    service_entry: String,
    service_command: Vec<String>,
    working_dir: PathBuf,
    kill_timeout: Duration,
    restart_grace: Duration,
}

impl ProcessManager {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            service_entry: config.service_entry.clone(),
            service_command: config.service_command.clone(),
            working_dir: config.project_root.clone(),
            kill_timeout: config.kill_timeout,
            restart_grace: config.restart_grace,
        }
    }

    pub fn service_entry(&self) -> &str {
        &self.service_entry
    }

    fn scan_processes(&self) -> Option<i32> {
        if self.service_entry.is_empty() {
            return None;
        }
        let own_pid = i32::try_from(std::process::id()).ok();
        let entries = match fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "cannot list processes");
                return None;
            }
        };

        let mut pids: Vec<i32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| Some(*pid) != own_pid)
            .collect();
        pids.sort_unstable();

        pids.into_iter().find(|pid| {
            read_cmdline(&Path::new("/proc").join(pid.to_string()))
                .is_some_and(|cmdline| cmdline.contains(&self.service_entry))
                && !is_zombie(*pid)
        })
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<bool> {
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(StockError::resource(
                format!("send {} to", signal.as_str()),
                format!("process {pid}"),
                errno,
            )),
        }
    }
}

#[async_trait]
impl ServiceControl for ProcessManager {
    async fn find_target_process(&self) -> Option<i32> {
        let found = self.scan_processes();
        match found {
            Some(pid) => info!(pid, entry = %self.service_entry, "service process found"),
            None => info!(entry = %self.service_entry, "no running service process"),
        }
        found
    }

    async fn stop_gracefully(&self, pid: i32, timeout: Duration) -> Result<()> {
        if pid <= 0 {
            return Err(StockError::resource("stop", format!("process {pid}"), "invalid pid"));
        }

        if !self.signal(pid, Signal::SIGTERM)? {
            info!(pid, "process already exited");
            return Ok(());
        }
        info!(pid, timeout_secs = timeout.as_secs_f64(), "SIGTERM sent, waiting for exit");
        if wait_for_exit(pid, timeout).await {
            info!(pid, "process stopped");
            return Ok(());
        }

        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        if !self.signal(pid, Signal::SIGKILL)? {
            info!(pid, "process exited before SIGKILL");
            return Ok(());
        }
        if wait_for_exit(pid, self.kill_timeout).await {
            info!(pid, "process killed");
            Ok(())
        } else {
            Err(StockError::resource(
                "kill",
                format!("process {pid}"),
                "still running after SIGKILL",
            ))
        }
    }

    async fn launch_service(&self) -> Result<i32> {
        let (program, args) = self
            .service_command
            .split_first()
            .ok_or_else(|| StockError::data("service command", "no program configured"))?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| StockError::resource("start", program, err))?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .unwrap_or_default();

        sleep(self.restart_grace).await;
        match child.try_wait() {
            Ok(None) => {
                info!(pid, command = %self.service_command.join(" "), "service started");
                Ok(pid)
            }
            Ok(Some(status)) => Err(StockError::resource(
                "start",
                program,
                format!("exited during startup ({status})"),
            )),
            Err(err) => Err(StockError::resource("inspect", program, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive_and_bogus_pids_are_not() {
        let own = i32::try_from(std::process::id()).unwrap();
        assert!(is_alive(own));
        assert!(!is_alive(0));
        assert!(!is_alive(-1));
        assert!(!is_alive(2_147_483_000));
    }

    #[test]
    fn own_process_is_never_a_target() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().into_owned();
        let config = AppConfig::default().with_service(name, vec!["true".to_string()]);
        assert_ne!(
            ProcessManager::new(&config).scan_processes(),
            i32::try_from(std::process::id()).ok()
        );
    }

    #[tokio::test]
    async fn launch_reports_immediate_exit() {
        let config = AppConfig::default()
            .with_project_root(std::env::temp_dir())
            .with_service("never-matches", vec!["false".to_string()])
            .with_timeouts(
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_millis(300),
            );
        let err = ProcessManager::new(&config).launch_service().await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::Resource);
    }
}
