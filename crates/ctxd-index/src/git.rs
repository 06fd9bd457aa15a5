//! Branch and repository lookups through the `git` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Upper bound on any single git invocation.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git timed out after {0:?}")]
    Timeout(Duration),

    #[error("git {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Repository facts needed while indexing.
///
/// "Not a repository" is a normal answer, never an error.
#[async_trait]
pub trait GitInfoProvider: Send + Sync {
    /// Current branch; a detached HEAD is reported as `detached-<short sha>`.
    async fn current_branch(&self, path: &Path) -> Option<String>;

    async fn repo_root(&self, path: &Path) -> Option<PathBuf>;

    async fn is_repo(&self, path: &Path) -> bool;
}

/// [`GitInfoProvider`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self { timeout: GIT_TIMEOUT }
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `git -C <dir> <args>` and return trimmed stdout.
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| GitError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(GitError::Failed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Directory to run git in: the path itself, or its parent for files.
fn working_dir(path: &Path) -> &Path {
    if path.is_file() {
        path.parent().unwrap_or(path)
    } else {
        path
    }
}

#[async_trait]
impl GitInfoProvider for GitCli {
    async fn current_branch(&self, path: &Path) -> Option<String> {
        let dir = working_dir(path);
        let branch = match self.run(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
            Ok(branch) => branch,
            Err(e) => {
                debug!("Not a git repository or git not available at {:?}: {}", dir, e);
                return None;
            }
        };

        if branch == "HEAD" {
            let sha = self.run(dir, &["rev-parse", "--short", "HEAD"]).await.ok()?;
            return Some(format!("detached-{}", sha));
        }

        debug!("Detected git branch: {}", branch);
        Some(branch)
    }

    async fn repo_root(&self, path: &Path) -> Option<PathBuf> {
        self.run(working_dir(path), &["rev-parse", "--show-toplevel"])
            .await
            .ok()
            .filter(|root| !root.is_empty())
            .map(PathBuf::from)
    }

    async fn is_repo(&self, path: &Path) -> bool {
        self.run(working_dir(path), &["rev-parse", "--git-dir"]).await.is_ok()
    }
}

/// Provider that reports a fixed branch, or no repository at all.
#[derive(Debug, Clone, Default)]
pub struct StaticGitInfo {
    branch: Option<String>,
}

impl StaticGitInfo {
    pub fn new(branch: Option<String>) -> Self {
        Self { branch }
    }
}

#[async_trait]
impl GitInfoProvider for StaticGitInfo {
    async fn current_branch(&self, _path: &Path) -> Option<String> {
        self.branch.clone()
    }

    async fn repo_root(&self, path: &Path) -> Option<PathBuf> {
        self.branch.as_ref().map(|_| path.to_path_buf())
    }

    async fn is_repo(&self, _path: &Path) -> bool {
        self.branch.is_some()
    }
}
