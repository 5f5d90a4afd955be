use crate::config::AppConfig;
use crate::core::{Result, StockError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// Source-control view the update orchestrator works against.
#[async_trait]
pub trait VersionOracle: Send + Sync {
    async fn local_ref(&self) -> Result<String>;
    async fn fetch(&self) -> Result<()>;
    async fn remote_ref(&self) -> Result<String>;
    async fn has_local_changes(&self) -> Result<bool>;
    /// Sets uncommitted work aside under `message` without discarding it.
    async fn stash_local_changes(&self, message: &str) -> Result<()>;
    async fn pull(&self) -> Result<()>;
}

/// [`VersionOracle`] backed by the `git` executable in the project root.
pub struct GitOracle {
    work_tree: PathBuf,
    remote: String,
    branch: String,
}

impl GitOracle {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            work_tree: config.project_root.clone(),
            remote: config.git_remote.clone(),
            branch: config.git_branch.clone(),
        }
    }

    fn remote_branch(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let command = format!("git {}", args.join(" "));
        debug!(%command, "running");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.work_tree)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| StockError::external(&command, err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let details = if stderr.is_empty() {
                output.status.to_string()
            } else {
                format!("{}: {stderr}", output.status)
            };
            return Err(StockError::external(command, details));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl VersionOracle for GitOracle {
    async fn local_ref(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    async fn fetch(&self) -> Result<()> {
        self.git(&["fetch", self.remote.as_str()]).await.map(|_| ())
    }

    async fn remote_ref(&self) -> Result<String> {
        self.git(&["rev-parse", self.remote_branch().as_str()]).await
    }

    async fn has_local_changes(&self) -> Result<bool> {
        Ok(!self.git(&["status", "--porcelain"]).await?.is_empty())
    }

    async fn stash_local_changes(&self, message: &str) -> Result<()> {
        self.git(&["stash", "push", "-m", message]).await?;
        info!(message, "local changes stashed");
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        let output = self.git(&["pull", self.remote.as_str(), self.branch.as_str()]).await?;
        info!(remote = %self.remote, branch = %self.branch, %output, "code pulled");
        Ok(())
    }
}
