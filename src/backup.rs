//! Data backups and deployable-tree snapshots.
//!
//! Data backups are single JSON files named `<prefix>-<YYYY-MM-DD-HHMM>.json`
//! in the backup directory. Tree snapshots are directories named
//! `version_<YYYYMMDD_HHMMSS>` in the snapshot directory. Both are written
//! once and only ever deleted by count-based pruning.

use crate::config::AppConfig;
use crate::core::{Clock, Result, StockError};
use crate::model::InventoryRecord;
use crate::storage::AtomicFileStore;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Weekday};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{info, warn};

pub const DATA_BACKUP_PREFIX: &str = "inventory";
pub const UPDATE_BACKUP_PREFIX: &str = "inventory-update";
pub const SNAPSHOT_PREFIX: &str = "version_";

const BACKUP_STAMP: &str = "%Y-%m-%d-%H%M";
const SNAPSHOT_STAMP: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Created(PathBuf),
    /// Scheduled backups do not run on Saturday or Sunday.
    SkippedWeekend,
    /// There is no data file to copy yet.
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Scheduled,
    PreUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub name: String,
    pub path: PathBuf,
    pub kind: BackupKind,
    pub taken_at: NaiveDateTime,
}

impl BackupArtifact {
    fn parse(dir: &Path, name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let (kind, stamp) = match stem.strip_prefix(UPDATE_BACKUP_PREFIX) {
            Some(rest) => (BackupKind::PreUpdate, rest.strip_prefix('-')?),
            None => (
                BackupKind::Scheduled,
                stem.strip_prefix(DATA_BACKUP_PREFIX)?.strip_prefix('-')?,
            ),
        };
        let taken_at = NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP).ok()?;
        Some(Self {
            name: name.to_string(),
            path: dir.join(name),
            kind,
            taken_at,
        })
    }
}

pub struct BackupManager {
    data_file: PathBuf,
    backup_dir: PathBuf,
    snapshot_dir: PathBuf,
    source_root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            data_file: config.data_file(),
            backup_dir: config.backup_dir(),
            snapshot_dir: config.snapshot_dir(),
            source_root: config.project_root.clone(),
            clock,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Entry point for the periodic scheduler: honours the weekend rule,
    /// then behaves like [`BackupManager::backup_data`].
    pub async fn scheduled_backup(&self, retention: usize) -> Result<BackupOutcome> {
        if matches!(self.clock.now().weekday(), Weekday::Sat | Weekday::Sun) {
            return Ok(BackupOutcome::SkippedWeekend);
        }
        self.backup_data(retention).await
    }

    /// Copies the live data file to a fresh timestamped artifact and keeps
    /// only the newest `retention` scheduled backups.
    pub async fn backup_data(&self, retention: usize) -> Result<BackupOutcome> {
        let outcome = self.copy_data_file(DATA_BACKUP_PREFIX).await?;
        if matches!(outcome, BackupOutcome::Created(_)) {
            self.prune_data_backups(retention).await;
        }
        Ok(outcome)
    }

    /// Unconditional copy taken right before a code update. Not subject to
    /// scheduled retention.
    pub async fn backup_for_update(&self) -> Result<BackupOutcome> {
        self.copy_data_file(UPDATE_BACKUP_PREFIX).await
    }

    async fn copy_data_file(&self, prefix: &str) -> Result<BackupOutcome> {
        match tokio::fs::metadata(&self.data_file).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(data_file = %self.data_file.display(), "no data file to back up");
                return Ok(BackupOutcome::NoData);
            }
            Err(err) => return Err(StockError::io("inspect", &self.data_file, err)),
        }

        let stamp = self.clock.now().format(BACKUP_STAMP).to_string();
        let target = self.backup_dir.join(format!("{prefix}-{stamp}.json"));
        let source = self.data_file.clone();
        let dest = target.clone();
        tokio::task::spawn_blocking(move || copy_file_atomically(&source, &dest)).await??;

        info!(backup = %target.display(), "data backup created");
        Ok(BackupOutcome::Created(target))
    }

    /// Scheduled and pre-update data backups, newest first.
    pub async fn list_data_backups(&self) -> Result<Vec<BackupArtifact>> {
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StockError::io("list", &self.backup_dir, err)),
        };

        let mut artifacts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StockError::io("list", &self.backup_dir, err))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(artifact) = BackupArtifact::parse(&self.backup_dir, &name) {
                artifacts.push(artifact);
            }
        }
        artifacts.sort_by(|a, b| b.taken_at.cmp(&a.taken_at).then_with(|| b.name.cmp(&a.name)));
        Ok(artifacts)
    }

    async fn prune_data_backups(&self, retention: usize) {
        let keep = retention.max(1);
        let scheduled: Vec<BackupArtifact> = match self.list_data_backups().await {
            Ok(all) => all
                .into_iter()
                .filter(|artifact| artifact.kind == BackupKind::Scheduled)
                .collect(),
            Err(err) => {
                warn!(error = %err, "could not list backups for pruning");
                return;
            }
        };
        if scheduled.len() <= keep {
            return;
        }

        let mut by_age: Vec<(SystemTime, BackupArtifact)> = Vec::with_capacity(scheduled.len());
        for artifact in scheduled {
            let created = tokio::fs::metadata(&artifact.path)
                .await
                .and_then(|meta| meta.created().or_else(|_| meta.modified()))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            by_age.push((created, artifact));
        }
        by_age.sort_by(|(a_time, a), (b_time, b)| {
            a_time
                .cmp(b_time)
                .then_with(|| a.taken_at.cmp(&b.taken_at))
                .then_with(|| a.name.cmp(&b.name))
        });

        let excess = by_age.len() - keep;
        for (_, artifact) in by_age.into_iter().take(excess) {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => info!(backup = %artifact.name, "old backup removed"),
                Err(err) => {
                    warn!(backup = %artifact.name, error = %err, "failed to remove old backup")
                }
            }
        }
    }

    /// Replaces the live data file with the named backup.
    ///
    /// The backup must parse as a record array. Callers holding a
    /// [`crate::storage::RecordRepository`] must invalidate its cache.
    pub async fn restore_data(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StockError::data(
                format!("backup name '{name}'"),
                "must be a plain file name",
            ));
        }
        let source = self.backup_dir.join(name);
        let bytes = match tokio::fs::read(&source).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StockError::not_found(format!("backup '{name}'")));
            }
            Err(err) => return Err(StockError::io("read", &source, err)),
        };
        let records: Vec<InventoryRecord> = serde_json::from_slice(&bytes)
            .map_err(|err| StockError::data(source.display(), err.to_string()))?;

        AtomicFileStore::new(&self.data_file).write(&records).await?;
        info!(backup = %name, records = records.len(), "data restored from backup");
        Ok(self.data_file.clone())
    }

    /// Copies `paths` (relative to the project root) into a new
    /// `version_<timestamp>` directory and prunes older snapshots.
    ///
    /// Missing sources are logged and skipped. Any copy failure removes the
    /// partial snapshot and is returned.
    pub async fn create_tree_snapshot(
        &self,
        paths: &[PathBuf],
        retention: usize,
    ) -> Result<PathBuf> {
        let stamp = self.clock.now().format(SNAPSHOT_STAMP).to_string();
        let target = self.snapshot_dir.join(format!("{SNAPSHOT_PREFIX}{stamp}"));
        let root = self.source_root.clone();
        let paths = paths.to_vec();
        let dest = target.clone();
        let snapshot_dir = self.snapshot_dir.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            fs::create_dir_all(&snapshot_dir)
                .map_err(|err| StockError::io("create directory", &snapshot_dir, err))?;
            fs::create_dir(&dest).map_err(|err| StockError::io("create snapshot", &dest, err))?;

            let copied = copy_into_snapshot(&root, &paths, &dest);
            if copied.is_err() {
                if let Err(err) = fs::remove_dir_all(&dest) {
                    warn!(
                        snapshot = %dest.display(),
                        error = %err,
                        "failed to remove partial snapshot"
                    );
                }
            }
            copied
        })
        .await??;

        info!(snapshot = %target.display(), "tree snapshot created");
        self.prune_snapshots(retention.max(1)).await;
        Ok(target)
    }

    /// Snapshot directories, oldest first.
    pub async fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.snapshot_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StockError::io("list", &self.snapshot_dir, err)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StockError::io("list", &self.snapshot_dir, err))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|kind| kind.is_dir()).unwrap_or(false);
            if is_dir && name.starts_with(SNAPSHOT_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names.into_iter().map(|name| self.snapshot_dir.join(name)).collect())
    }

    async fn prune_snapshots(&self, keep: usize) {
        let snapshots = match self.list_snapshots().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "could not list snapshots for pruning");
                return;
            }
        };
        if snapshots.len() <= keep {
            return;
        }
        let excess = snapshots.len() - keep;
        for old in snapshots.into_iter().take(excess) {
            match tokio::fs::remove_dir_all(&old).await {
                Ok(()) => info!(snapshot = %old.display(), "old snapshot removed"),
                Err(err) => {
                    warn!(snapshot = %old.display(), error = %err, "failed to remove old snapshot")
                }
            }
        }
    }
}

/// Fallback artifacts the update orchestrator takes before touching code.
#[async_trait]
pub trait UpdateBackups: Send + Sync {
    async fn create_tree_snapshot(&self, paths: &[PathBuf], retention: usize) -> Result<PathBuf>;
    async fn backup_for_update(&self) -> Result<BackupOutcome>;
}

#[async_trait]
impl UpdateBackups for BackupManager {
    async fn create_tree_snapshot(&self, paths: &[PathBuf], retention: usize) -> Result<PathBuf> {
        BackupManager::create_tree_snapshot(self, paths, retention).await
    }

    async fn backup_for_update(&self) -> Result<BackupOutcome> {
        BackupManager::backup_for_update(self).await
    }
}

fn copy_file_atomically(source: &Path, dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| StockError::io("create directory", dir, err))?;

    let mut input = fs::File::open(source).map_err(|err| StockError::io("open", source, err))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".backup.")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| StockError::io("create temp file in", dir, err))?;

    let copied = io::copy(&mut input, &mut temp)
        .and_then(|_| temp.flush())
        .and_then(|_| temp.as_file().sync_all());
    if let Err(err) = copied {
        return Err(StockError::io("copy", source, err));
    }
    temp.persist(dest)
        .map_err(|err| StockError::io("persist", dest, err.error))?;
    Ok(())
}

fn copy_into_snapshot(root: &Path, paths: &[PathBuf], dest: &Path) -> Result<()> {
    for relative in paths {
        let source = root.join(relative);
        let meta = match fs::metadata(&source) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %relative.display(), "snapshot source not found, skipped");
                continue;
            }
            Err(err) => return Err(StockError::io("inspect", &source, err)),
        };

        let target = dest.join(relative);
        if meta.is_dir() {
            copy_dir_recursive(&source, &target)?;
            info!(path = %relative.display(), "directory added to snapshot");
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| StockError::io("create directory", parent, err))?;
            }
            fs::copy(&source, &target).map_err(|err| StockError::io("copy", &source, err))?;
            info!(path = %relative.display(), "file added to snapshot");
        }
    }
    Ok(())
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|err| StockError::io("create directory", dest, err))?;
    let entries = fs::read_dir(source).map_err(|err| StockError::io("list", source, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StockError::io("list", source, err))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = fs::metadata(&from).map_err(|err| StockError::io("inspect", &from, err))?;
        if meta.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|err| StockError::io("copy", &from, err))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_artifact_names() {
        let dir = Path::new("/b");
        let scheduled = BackupArtifact::parse(dir, "inventory-2026-10-12-1700.json").unwrap();
        assert_eq!(scheduled.kind, BackupKind::Scheduled);
        assert_eq!(scheduled.taken_at.format("%Y-%m-%d %H:%M").to_string(), "2026-10-12 17:00");

        let update = BackupArtifact::parse(dir, "inventory-update-2026-10-12-0200.json").unwrap();
        assert_eq!(update.kind, BackupKind::PreUpdate);

        assert!(BackupArtifact::parse(dir, "inventory.json").is_none());
        assert!(BackupArtifact::parse(dir, "inventory-latest.json").is_none());
        assert!(BackupArtifact::parse(dir, "notes-2026-10-12-1700.json").is_none());
    }
}
