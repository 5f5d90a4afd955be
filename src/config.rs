use crate::scheduler::Schedule;
use anyhow::{Context, Result};
use chrono::Weekday;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATA_FILE_NAME: &str = "inventory.json";

/// Runtime configuration for the record store and the updater.
///
/// Built once at process start and handed to every component constructor.
/// Relative paths are resolved against `project_root`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root of the deployable tree (git work tree, snapshot source)
    pub project_root: PathBuf,

    /// Directory holding `inventory.json`
    pub data_dir: PathBuf,

    /// Directory receiving timestamped data backups
    pub backup_dir: PathBuf,

    /// Directory receiving `version_*` tree snapshots
    pub snapshot_dir: PathBuf,

    /// Update lock marker
    pub lock_file: PathBuf,

    /// Updater log file
    pub log_file: PathBuf,

    /// Substring identifying the service in a process command line
    pub service_entry: String,

    /// Program and arguments used to (re)start the service
    pub service_command: Vec<String>,

    /// Paths copied into each tree snapshot
    pub snapshot_paths: Vec<PathBuf>,

    /// Scheduled data backups kept
    pub backup_retention: usize,

    /// Tree snapshots kept
    pub snapshot_retention: usize,

    /// Maximum age of the repository read cache
    pub cache_ttl: Duration,

    pub backup_schedule: Schedule,
    pub update_schedule: Schedule,

    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,

    /// Wait after SIGKILL
    pub kill_timeout: Duration,

    /// How long a restarted service must stay alive to count as started
    pub restart_grace: Duration,

    pub git_remote: String,
    pub git_branch: String,

    /// Scheduler wake-up interval
    pub poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            data_dir: PathBuf::from("data"),
            backup_dir: PathBuf::from("db_backup"),
            snapshot_dir: PathBuf::from("version_backup"),
            lock_file: PathBuf::from("updater.lock"),
            log_file: PathBuf::from("updater.log"),
            service_entry: "app.py".to_string(),
            service_command: vec!["python3".to_string(), "app.py".to_string()],
            snapshot_paths: ["app.py", "requirements.txt", "static", "templates", "data"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            backup_retention: 5,
            snapshot_retention: 3,
            cache_ttl: Duration::from_secs(1),
            backup_schedule: Schedule::every_days(2, 17, 0),
            update_schedule: Schedule::weekly(Weekday::Mon, 2, 0),
            stop_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(5),
            restart_grace: Duration::from_secs(2),
            git_remote: "origin".to_string(),
            git_branch: "main".to_string(),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `STOCKROOM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(root) = env_var("STOCKROOM_PROJECT_ROOT") {
            config.project_root = PathBuf::from(root);
        }
        if let Some(dir) = env_var("STOCKROOM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_var("STOCKROOM_BACKUP_DIR") {
            config.backup_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_var("STOCKROOM_SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_var("STOCKROOM_LOCK_FILE") {
            config.lock_file = PathBuf::from(path);
        }
        if let Some(path) = env_var("STOCKROOM_LOG_FILE") {
            config.log_file = PathBuf::from(path);
        }
        if let Some(entry) = env_var("STOCKROOM_SERVICE_ENTRY") {
            config.service_entry = entry;
        }
        if let Some(command) = env_var("STOCKROOM_SERVICE_COMMAND") {
            config.service_command = command.split_whitespace().map(str::to_string).collect();
            if config.service_command.is_empty() {
                anyhow::bail!("STOCKROOM_SERVICE_COMMAND must name a program");
            }
        }
        if let Some(paths) = env_var("STOCKROOM_SNAPSHOT_PATHS") {
            config.snapshot_paths = paths
                .split(',')
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(raw) = env_var("STOCKROOM_BACKUP_RETENTION") {
            config.backup_retention = raw
                .parse()
                .context("STOCKROOM_BACKUP_RETENTION must be a non-negative integer")?;
        }
        if let Some(raw) = env_var("STOCKROOM_SNAPSHOT_RETENTION") {
            config.snapshot_retention = raw
                .parse()
                .context("STOCKROOM_SNAPSHOT_RETENTION must be a non-negative integer")?;
        }
        if let Some(raw) = env_var("STOCKROOM_CACHE_TTL_MS") {
            config.cache_ttl = Duration::from_millis(
                raw.parse()
                    .context("STOCKROOM_CACHE_TTL_MS must be milliseconds")?,
            );
        }
        if let Some(raw) = env_var("STOCKROOM_BACKUP_SCHEDULE") {
            config.backup_schedule = raw
                .parse()
                .context("STOCKROOM_BACKUP_SCHEDULE is not a valid schedule")?;
        }
        if let Some(raw) = env_var("STOCKROOM_UPDATE_SCHEDULE") {
            config.update_schedule = raw
                .parse()
                .context("STOCKROOM_UPDATE_SCHEDULE is not a valid schedule")?;
        }
        if let Some(raw) = env_var("STOCKROOM_STOP_TIMEOUT_SECS") {
            config.stop_timeout = Duration::from_secs(
                raw.parse()
                    .context("STOCKROOM_STOP_TIMEOUT_SECS must be seconds")?,
            );
        }
        if let Some(raw) = env_var("STOCKROOM_RESTART_GRACE_SECS") {
            config.restart_grace = Duration::from_secs(
                raw.parse()
                    .context("STOCKROOM_RESTART_GRACE_SECS must be seconds")?,
            );
        }
        if let Some(remote) = env_var("STOCKROOM_GIT_REMOTE") {
            config.git_remote = remote;
        }
        if let Some(branch) = env_var("STOCKROOM_GIT_BRANCH") {
            config.git_branch = branch;
        }

        Ok(config)
    }

    /// Set the project root
    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = root.into();
        self
    }

    /// Set the service entry marker and the command that starts it
    pub fn with_service(mut self, entry: impl Into<String>, command: Vec<String>) -> Self {
        self.service_entry = entry.into();
        self.service_command = command;
        self
    }

    pub fn with_snapshot_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.snapshot_paths = paths;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_timeouts(
        mut self,
        stop: Duration,
        kill: Duration,
        restart_grace: Duration,
    ) -> Self {
        self.stop_timeout = stop;
        self.kill_timeout = kill;
        self.restart_grace = restart_grace;
        self
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn data_file(&self) -> PathBuf {
        self.resolve(&self.data_dir).join(DATA_FILE_NAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.backup_dir)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.resolve(&self.snapshot_dir)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.resolve(&self.lock_file)
    }

    pub fn log_file(&self) -> PathBuf {
        self.resolve(&self.log_file)
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_under_project_root() {
        let config = AppConfig::default().with_project_root("/srv/stock");
        assert_eq!(config.data_file(), PathBuf::from("/srv/stock/data/inventory.json"));
        assert_eq!(config.backup_dir(), PathBuf::from("/srv/stock/db_backup"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/srv/stock/version_backup"));
        assert_eq!(config.lock_file(), PathBuf::from("/srv/stock/updater.lock"));
        assert_eq!(config.backup_retention, 5);
        assert_eq!(config.snapshot_retention, 3);
        assert_eq!(config.cache_ttl, Duration::from_secs(1));
    }

    #[test]
    fn absolute_paths_are_kept() {
        let mut config = AppConfig::default().with_project_root("/srv/stock");
        config.lock_file = PathBuf::from("/run/stockroom.lock");
        assert_eq!(config.lock_file(), PathBuf::from("/run/stockroom.lock"));
    }
}
