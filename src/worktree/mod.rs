pub mod git;
pub mod paths;

use std::path::PathBuf;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use git::{GitCli, GitExecutor, GitOutput, GitWorktreeManager};

/// Worktree names become directory names and branch suffixes.
static WORKTREE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").expect("Invalid worktree name regex")
});

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Invalid worktree name: {0}")]
    InvalidName(String),
    #[error("Worktree not found: {0}")]
    NotFound(String),
    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Git operation cancelled")]
    Cancelled,
}

/// An isolated working copy for one drone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub repo_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    /// Defaults to `<namespace>/<name>`.
    pub branch: Option<String>,
    /// Defaults to the repository's current branch, then `main`.
    pub base_branch: Option<String>,
}

impl CreateOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait WorktreeManager: Send + Sync {
    /// Returns the existing worktree when one is already registered at the target path.
    async fn create(&self, opts: CreateOptions, cancel: &CancellationToken) -> Result<Worktree, WorktreeError>;
    async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<(), WorktreeError>;
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<Worktree>, WorktreeError>;
    async fn get(&self, name: &str, cancel: &CancellationToken) -> Result<Worktree, WorktreeError>;
    async fn prune(&self, cancel: &CancellationToken) -> Result<(), WorktreeError>;
}

pub fn validate_name(name: &str) -> Result<(), WorktreeError> {
    if name.contains("..") || !WORKTREE_NAME_REGEX.is_match(name) {
        return Err(WorktreeError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("drone-1").is_ok());
        assert!(validate_name("queen").is_ok());
        assert!(validate_name("feature_2.x").is_ok());

        for bad in ["", "../escape", "a/b", "-flag", "a..b", "with space"] {
            assert!(
                matches!(validate_name(bad), Err(WorktreeError::InvalidName(_))),
                "{:?} accepted",
                bad
            );
        }
    }
}
