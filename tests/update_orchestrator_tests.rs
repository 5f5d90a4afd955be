/// Update orchestrator tests
///
/// The state machine driven against recording doubles of the version
/// oracle, the service and the backup manager.
/// Run with: cargo test --test update_orchestrator_tests

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stockroom::{
    AppConfig, BackupOutcome, ErrorKind, ManualClock, Result, ServiceControl, StockError,
    UpdateBackups, UpdateOrchestrator, UpdateOutcome, UpdateState, VersionOracle,
};

type Events = Arc<Mutex<Vec<String>>>;

fn record(events: &Events, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

#[derive(Default)]
struct OracleScript {
    local: String,
    remote: String,
    dirty: bool,
    fail_pull: bool,
    fetch_delay: Duration,
}

struct RecordingOracle {
    script: OracleScript,
    events: Events,
}

#[async_trait]
impl VersionOracle for RecordingOracle {
    async fn local_ref(&self) -> Result<String> {
        record(&self.events, "local_ref");
        Ok(self.script.local.clone())
    }

    async fn fetch(&self) -> Result<()> {
        record(&self.events, "fetch");
        tokio::time::sleep(self.script.fetch_delay).await;
        Ok(())
    }

    async fn remote_ref(&self) -> Result<String> {
        record(&self.events, "remote_ref");
        Ok(self.script.remote.clone())
    }

    async fn has_local_changes(&self) -> Result<bool> {
        record(&self.events, "status");
        Ok(self.script.dirty)
    }

    async fn stash_local_changes(&self, message: &str) -> Result<()> {
        record(&self.events, format!("stash:{message}"));
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        record(&self.events, "pull");
        if self.script.fail_pull {
            Err(StockError::external("git pull origin main", "merge conflict"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct ServiceScript {
    running: Option<i32>,
    fail_stop: bool,
    fail_launch: bool,
}

struct RecordingService {
    script: ServiceScript,
    events: Events,
}

#[async_trait]
impl ServiceControl for RecordingService {
    async fn find_target_process(&self) -> Option<i32> {
        record(&self.events, "find");
        self.script.running
    }

    async fn stop_gracefully(&self, pid: i32, _timeout: Duration) -> Result<()> {
        record(&self.events, format!("stop:{pid}"));
        if self.script.fail_stop {
            Err(StockError::resource("send SIGTERM to", format!("process {pid}"), "EPERM"))
        } else {
            Ok(())
        }
    }

    async fn launch_service(&self) -> Result<i32> {
        record(&self.events, "launch");
        if self.script.fail_launch {
            Err(StockError::resource("start", "python3", "exited during startup"))
        } else {
            Ok(5151)
        }
    }
}

struct RecordingBackups {
    fail_snapshot: bool,
    events: Events,
}

#[async_trait]
impl UpdateBackups for RecordingBackups {
    async fn create_tree_snapshot(&self, paths: &[PathBuf], retention: usize) -> Result<PathBuf> {
        record(&self.events, format!("snapshot:{}:{retention}", paths.len()));
        if self.fail_snapshot {
            Err(StockError::resource("copy", "static", "disk full"))
        } else {
            Ok(PathBuf::from("version_backup/version_20261012_020000"))
        }
    }

    async fn backup_for_update(&self) -> Result<BackupOutcome> {
        record(&self.events, "backup_for_update");
        Ok(BackupOutcome::Created(PathBuf::from(
            "db_backup/inventory-update-2026-10-12-0200.json",
        )))
    }
}

struct Harness {
    orchestrator: Arc<UpdateOrchestrator>,
    events: Events,
    lock_file: PathBuf,
}

fn harness(
    root: &Path,
    oracle: OracleScript,
    service: ServiceScript,
    fail_snapshot: bool,
) -> Harness {
    let config = AppConfig::default().with_project_root(root);
    let events: Events = Arc::default();
    let clock = Arc::new(ManualClock::new(
        NaiveDate::from_ymd_opt(2026, 10, 12)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap(),
    ));
    let orchestrator = UpdateOrchestrator::new(
        &config,
        Arc::new(RecordingOracle {
            script: oracle,
            events: events.clone(),
        }),
        Arc::new(RecordingService {
            script: service,
            events: events.clone(),
        }),
        Arc::new(RecordingBackups {
            fail_snapshot,
            events: events.clone(),
        }),
        clock,
    );
    Harness {
        orchestrator: Arc::new(orchestrator),
        events,
        lock_file: config.lock_file(),
    }
}

fn changed() -> OracleScript {
    OracleScript {
        local: "aaa111".to_string(),
        remote: "bbb222".to_string(),
        ..OracleScript::default()
    }
}

fn running() -> ServiceScript {
    ServiceScript {
        running: Some(4242),
        ..ServiceScript::default()
    }
}

fn snapshot_of(events: &Events) -> Vec<String> {
    events.lock().unwrap().clone()
}

#[tokio::test]
async fn test_no_change_only_checks_versions() {
    let temp = tempfile::tempdir().expect("temp dir");
    let oracle = OracleScript {
        local: "abc123".to_string(),
        remote: "abc123".to_string(),
        ..OracleScript::default()
    };
    let h = harness(temp.path(), oracle, running(), false);

    let report = h.orchestrator.run_update_check().await;

    assert_eq!(
        report.outcome,
        UpdateOutcome::NoChange {
            revision: "abc123".to_string()
        }
    );
    assert_eq!(
        report.transitions,
        vec![
            UpdateState::Idle,
            UpdateState::LockAcquired,
            UpdateState::VersionChecked,
            UpdateState::Idle,
        ]
    );
    assert_eq!(snapshot_of(&h.events), vec!["local_ref", "fetch", "remote_ref"]);
    assert!(!h.lock_file.exists());
}

#[tokio::test]
async fn test_change_runs_full_sequence_in_order() {
    let temp = tempfile::tempdir().expect("temp dir");
    let h = harness(temp.path(), changed(), running(), false);

    let report = h.orchestrator.run_update_check().await;

    assert_eq!(
        report.outcome,
        UpdateOutcome::Updated {
            from: "aaa111".to_string(),
            to: "bbb222".to_string()
        }
    );
    assert_eq!(
        report.transitions,
        vec![
            UpdateState::Idle,
            UpdateState::LockAcquired,
            UpdateState::VersionChecked,
            UpdateState::BackedUp,
            UpdateState::Stopped,
            UpdateState::Updated,
            UpdateState::Restarted,
            UpdateState::Idle,
        ]
    );
    assert_eq!(
        snapshot_of(&h.events),
        vec![
            "local_ref",
            "fetch",
            "remote_ref",
            "snapshot:5:3",
            "backup_for_update",
            "find",
            "stop:4242",
            "status",
            "pull",
            "launch",
        ]
    );
    assert_eq!(report.compensating_restart, None);
    assert!(!h.lock_file.exists());
}

#[tokio::test]
async fn test_local_changes_are_stashed_before_pull() {
    let temp = tempfile::tempdir().expect("temp dir");
    let oracle = OracleScript {
        dirty: true,
        ..changed()
    };
    let h = harness(temp.path(), oracle, running(), false);

    h.orchestrator.run_update_check().await;

    let events = snapshot_of(&h.events);
    let stash = events
        .iter()
        .position(|e| e == "stash:Auto-stash before update 2026-10-12T02:00:00")
        .expect("stash recorded");
    let pull = events.iter().position(|e| e == "pull").expect("pull recorded");
    assert!(stash < pull);
}

#[tokio::test]
async fn test_missing_service_is_not_stopped_but_is_launched() {
    let temp = tempfile::tempdir().expect("temp dir");
    let h = harness(temp.path(), changed(), ServiceScript::default(), false);

    let report = h.orchestrator.run_update_check().await;

    assert!(matches!(report.outcome, UpdateOutcome::Updated { .. }));
    let events = snapshot_of(&h.events);
    assert!(!events.iter().any(|e| e.starts_with("stop:")));
    assert_eq!(events.last().map(String::as_str), Some("launch"));
}

#[tokio::test]
async fn test_failed_pull_aborts_and_restarts_previous_version() {
    let temp = tempfile::tempdir().expect("temp dir");
    let oracle = OracleScript {
        fail_pull: true,
        ..changed()
    };
    let h = harness(temp.path(), oracle, running(), false);

    let report = h.orchestrator.run_update_check().await;

    match &report.outcome {
        UpdateOutcome::Aborted { at, kind, .. } => {
            assert_eq!(*at, UpdateState::Updated);
            assert_eq!(*kind, ErrorKind::ExternalTool);
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(report.final_state(), UpdateState::Aborted);
    assert_eq!(report.compensating_restart, Some(true));
    let events = snapshot_of(&h.events);
    assert_eq!(events[events.len() - 2..].to_vec(), vec!["pull", "launch"]);
    assert!(!h.lock_file.exists());
}

#[tokio::test]
async fn test_failed_snapshot_aborts_before_touching_service() {
    let temp = tempfile::tempdir().expect("temp dir");
    let h = harness(temp.path(), changed(), running(), true);

    let report = h.orchestrator.run_update_check().await;

    assert!(matches!(
        report.outcome,
        UpdateOutcome::Aborted {
            at: UpdateState::BackedUp,
            kind: ErrorKind::Resource,
            ..
        }
    ));
    let events = snapshot_of(&h.events);
    assert!(!events.iter().any(|e| e == "find" || e == "pull" || e == "launch"));
    assert!(!h.lock_file.exists());
}

#[tokio::test]
async fn test_failed_stop_aborts_without_pull() {
    let temp = tempfile::tempdir().expect("temp dir");
    let service = ServiceScript {
        fail_stop: true,
        ..running()
    };
    let h = harness(temp.path(), changed(), service, false);

    let report = h.orchestrator.run_update_check().await;

    assert!(matches!(
        report.outcome,
        UpdateOutcome::Aborted {
            at: UpdateState::Stopped,
            ..
        }
    ));
    assert!(!snapshot_of(&h.events).iter().any(|e| e == "pull"));
    assert!(!h.lock_file.exists());
}

#[tokio::test]
async fn test_launch_that_dies_is_a_restart_failure() {
    let temp = tempfile::tempdir().expect("temp dir");
    let service = ServiceScript {
        fail_launch: true,
        ..running()
    };
    let h = harness(temp.path(), changed(), service, false);

    let report = h.orchestrator.run_update_check().await;

    assert!(matches!(
        report.outcome,
        UpdateOutcome::Aborted {
            at: UpdateState::Restarted,
            ..
        }
    ));
    assert!(!h.lock_file.exists());
}

#[tokio::test]
async fn test_concurrent_run_is_skipped_without_side_effects() {
    let temp = tempfile::tempdir().expect("temp dir");
    let slow = OracleScript {
        fetch_delay: Duration::from_millis(500),
        ..changed()
    };
    let first = harness(temp.path(), slow, running(), false);
    let second = harness(temp.path(), changed(), running(), false);

    let orchestrator = Arc::clone(&first.orchestrator);
    let long_run = tokio::spawn(async move { orchestrator.run_update_check().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = second.orchestrator.run_update_check().await;
    let own_pid = i32::try_from(std::process::id()).unwrap();
    assert_eq!(report.outcome, UpdateOutcome::Skipped { holder_pid: own_pid });
    assert_eq!(report.transitions, vec![UpdateState::Idle]);
    assert!(snapshot_of(&second.events).is_empty());
    assert!(first.lock_file.exists());

    let first_report = long_run.await.unwrap();
    assert!(matches!(first_report.outcome, UpdateOutcome::Updated { .. }));
    assert!(!first.lock_file.exists());
}
