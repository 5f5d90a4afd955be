// ============================================================================
// Stockroom Library
// ============================================================================

pub mod backup;
pub mod config;
pub mod core;
pub mod lock;
pub mod model;
pub mod process;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod updater;
pub mod version;

// Re-export main types for convenience
pub use crate::core::{Clock, ErrorKind, ManualClock, Result, StockError, SystemClock};
pub use config::AppConfig;
pub use model::{InventoryRecord, NaturalKey, StockStatus};

// Record store
pub use service::{AddOutcome, InventoryService, RecordPatch};
pub use storage::{AtomicFileStore, RecordRepository, RecordSet};

// ============================================================================
// Operations
// ============================================================================

pub use backup::{BackupArtifact, BackupKind, BackupManager, BackupOutcome, UpdateBackups};
pub use lock::{LockAttempt, UpdateLock, UpdateLockGuard};
pub use process::{ProcessManager, ServiceControl, is_alive};
pub use scheduler::{DueTracker, Schedule, run_scheduled, spawn_backup_loop};
pub use telemetry::init_tracing;
pub use updater::{UpdateOrchestrator, UpdateOutcome, UpdateReport, UpdateState, run_daemon};
pub use version::{GitOracle, VersionOracle};
