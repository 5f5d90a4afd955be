//! Self-update orchestration.
//!
//! One run walks `Idle → LockAcquired → VersionChecked → BackedUp → Stopped →
//! Updated → Restarted → Idle`. Any failure after the lock is taken ends the
//! run in `Aborted`; the lock is released on every path.

use crate::backup::{BackupManager, BackupOutcome, UpdateBackups};
use crate::config::AppConfig;
use crate::core::{Clock, ErrorKind, Result, StockError};
use crate::lock::{LockAttempt, UpdateLock};
use crate::process::{ProcessManager, ServiceControl};
use crate::scheduler::{run_scheduled, Schedule};
use crate::version::{GitOracle, VersionOracle};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    LockAcquired,
    VersionChecked,
    BackedUp,
    Stopped,
    Updated,
    Restarted,
    Aborted,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::LockAcquired => "lock_acquired",
            Self::VersionChecked => "version_checked",
            Self::BackedUp => "backed_up",
            Self::Stopped => "stopped",
            Self::Updated => "updated",
            Self::Restarted => "restarted",
            Self::Aborted => "aborted",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Local and remote revisions match.
    NoChange { revision: String },
    Updated { from: String, to: String },
    /// Another live run owns the lock.
    Skipped { holder_pid: i32 },
    /// `at` is the state the run was trying to reach when it failed.
    Aborted {
        at: UpdateState,
        kind: ErrorKind,
        reason: String,
    },
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChange { revision } => write!(f, "already at {revision}"),
            Self::Updated { from, to } => write!(f, "updated {from} -> {to}"),
            Self::Skipped { holder_pid } => write!(f, "skipped, lock held by {holder_pid}"),
            Self::Aborted { at, kind, reason } => {
                write!(f, "aborted before {at} ({kind}): {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub outcome: UpdateOutcome,
    /// Every state entered, in order.
    pub transitions: Vec<UpdateState>,
    /// `Some(started)` when a failed pull triggered a restart of the old code.
    pub compensating_restart: Option<bool>,
}

impl UpdateReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, UpdateOutcome::Aborted { .. })
    }

    pub fn final_state(&self) -> UpdateState {
        self.transitions.last().copied().unwrap_or(UpdateState::Idle)
    }
}

struct Run {
    transitions: Vec<UpdateState>,
    compensating_restart: Option<bool>,
}

impl Run {
    fn enter(&mut self, state: UpdateState) {
        info!(state = %state, "update state");
        self.transitions.push(state);
    }
}

type StepResult<T> = std::result::Result<T, (UpdateState, StockError)>;

trait AtState<T> {
    fn at(self, state: UpdateState) -> StepResult<T>;
}

impl<T> AtState<T> for Result<T> {
    fn at(self, state: UpdateState) -> StepResult<T> {
        self.map_err(|err| (state, err))
    }
}

pub struct UpdateOrchestrator {
    lock_file: PathBuf,
    snapshot_paths: Vec<PathBuf>,
    snapshot_retention: usize,
    stop_timeout: Duration,
    oracle: Arc<dyn VersionOracle>,
    service: Arc<dyn ServiceControl>,
    backups: Arc<dyn UpdateBackups>,
    clock: Arc<dyn Clock>,
}

impl UpdateOrchestrator {
    pub fn new(
        config: &AppConfig,
        oracle: Arc<dyn VersionOracle>,
        service: Arc<dyn ServiceControl>,
        backups: Arc<dyn UpdateBackups>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lock_file: config.lock_file(),
            snapshot_paths: config.snapshot_paths.clone(),
            snapshot_retention: config.snapshot_retention,
            stop_timeout: config.stop_timeout,
            oracle,
            service,
            backups,
            clock,
        }
    }

    /// Wires the git, process and filesystem collaborators from `config`.
    pub fn from_config(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config,
            Arc::new(GitOracle::new(config)),
            Arc::new(ProcessManager::new(config)),
            Arc::new(BackupManager::new(config, Arc::clone(&clock))),
            clock,
        )
    }

    /// One complete update check. Never returns an error: failures are
    /// reported in the outcome after the lock has been released.
    pub async fn run_update_check(&self) -> UpdateReport {
        let started = Instant::now();
        info!(lock = %self.lock_file.display(), "update check started");

        let mut run = Run {
            transitions: vec![UpdateState::Idle],
            compensating_restart: None,
        };

        let outcome = match UpdateLock::acquire(&self.lock_file) {
            Ok(LockAttempt::Held { pid }) => {
                info!(holder_pid = pid, "another update is in progress, skipping");
                UpdateOutcome::Skipped { holder_pid: pid }
            }
            Err(err) => {
                error!(error = %err, "could not take the update lock");
                run.enter(UpdateState::Aborted);
                UpdateOutcome::Aborted {
                    at: UpdateState::LockAcquired,
                    kind: err.kind(),
                    reason: err.to_string(),
                }
            }
            Ok(LockAttempt::Acquired(guard)) => {
                run.enter(UpdateState::LockAcquired);
                let result = self.run_locked(&mut run).await;
                if let Err(err) = guard.release() {
                    warn!(error = %err, "update lock release failed");
                }
                match result {
                    Ok(outcome) => outcome,
                    Err((at, err)) => {
                        error!(state = %at, kind = %err.kind(), error = %err, "update aborted");
                        run.enter(UpdateState::Aborted);
                        UpdateOutcome::Aborted {
                            at,
                            kind: err.kind(),
                            reason: err.to_string(),
                        }
                    }
                }
            }
        };

        info!(
            outcome = %outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "update check finished"
        );
        UpdateReport {
            outcome,
            transitions: run.transitions,
            compensating_restart: run.compensating_restart,
        }
    }

    async fn run_locked(&self, run: &mut Run) -> StepResult<UpdateOutcome> {
        let local = self.oracle.local_ref().await.at(UpdateState::VersionChecked)?;
        self.oracle.fetch().await.at(UpdateState::VersionChecked)?;
        let remote = self.oracle.remote_ref().await.at(UpdateState::VersionChecked)?;
        run.enter(UpdateState::VersionChecked);

        if local == remote {
            info!(revision = %local, "already up to date");
            run.enter(UpdateState::Idle);
            return Ok(UpdateOutcome::NoChange { revision: local });
        }
        info!(local = %local, remote = %remote, "new version available");

        let snapshot = self
            .backups
            .create_tree_snapshot(&self.snapshot_paths, self.snapshot_retention)
            .await
            .at(UpdateState::BackedUp)?;
        match self.backups.backup_for_update().await.at(UpdateState::BackedUp)? {
            BackupOutcome::Created(path) => info!(
                snapshot = %snapshot.display(),
                backup = %path.display(),
                "fallback artifacts ready"
            ),
            _ => warn!(
                snapshot = %snapshot.display(),
                "no data file, only the tree snapshot was taken"
            ),
        }
        run.enter(UpdateState::BackedUp);

        let stopped = match self.service.find_target_process().await {
            Some(pid) => {
                self.service
                    .stop_gracefully(pid, self.stop_timeout)
                    .await
                    .at(UpdateState::Stopped)?;
                Some(pid)
            }
            None => None,
        };
        run.enter(UpdateState::Stopped);

        if let Err(err) = self.apply_update().await {
            if stopped.is_some() {
                warn!("update failed, restarting the previous version");
                let restarted = match self.service.launch_service().await {
                    Ok(pid) => {
                        info!(pid, "previous version restarted");
                        true
                    }
                    Err(restart_err) => {
                        error!(error = %restart_err, "previous version could not be restarted");
                        false
                    }
                };
                run.compensating_restart = Some(restarted);
            }
            return Err((UpdateState::Updated, err));
        }
        run.enter(UpdateState::Updated);

        let pid = self.service.launch_service().await.at(UpdateState::Restarted)?;
        info!(pid, revision = %remote, "service running new version");
        run.enter(UpdateState::Restarted);
        run.enter(UpdateState::Idle);

        Ok(UpdateOutcome::Updated {
            from: local,
            to: remote,
        })
    }

    async fn apply_update(&self) -> Result<()> {
        if self.oracle.has_local_changes().await? {
            let message = format!(
                "Auto-stash before update {}",
                self.clock.now().format("%Y-%m-%dT%H:%M:%S")
            );
            warn!("local changes found, stashing them");
            self.oracle.stash_local_changes(&message).await?;
        }
        self.oracle.pull().await
    }
}

/// Runs update checks on `schedule` until `shutdown` flips to `true`.
pub async fn run_daemon(
    orchestrator: Arc<UpdateOrchestrator>,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    run_scheduled("update-check", schedule, clock, poll_interval, shutdown, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let report = orchestrator.run_update_check().await;
            if report.is_aborted() {
                warn!(outcome = %report.outcome, "scheduled update did not complete");
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display_names_the_failed_state() {
        let outcome = UpdateOutcome::Aborted {
            at: UpdateState::Stopped,
            kind: ErrorKind::Resource,
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            outcome.to_string(),
            "aborted before stopped (resource): permission denied"
        );
    }

    #[test]
    fn final_state_defaults_to_idle() {
        let report = UpdateReport {
            outcome: UpdateOutcome::Skipped { holder_pid: 1 },
            transitions: Vec::new(),
            compensating_restart: None,
        };
        assert_eq!(report.final_state(), UpdateState::Idle);
    }
}
