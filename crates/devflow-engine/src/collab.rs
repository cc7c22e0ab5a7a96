//! Collaborator interfaces the engine consumes but does not implement.
//!
//! Issue trackers and version control live outside the core; callers inject
//! implementations at construction. The engine only ever stores the paths
//! and references these hand back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// What an issue tracker knows about a task.
#[derive(Debug, Clone)]
pub struct IssueDetails {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Source of issue context, e.g. a GitHub adapter.
#[async_trait]
pub trait IssueSource: Send + Sync {
    async fn fetch(&self, issue_ref: &str) -> anyhow::Result<IssueDetails>;
    async fn post_comment(&self, issue_ref: &str, text: &str) -> anyhow::Result<()>;
}

/// Version-control workspace operations, e.g. a git adapter.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create a worktree for `branch` off `base` and return its path.
    async fn create_worktree(&self, branch: &str, base: &str) -> anyhow::Result<PathBuf>;
    async fn commit(&self, path: &Path, message: &str) -> anyhow::Result<()>;
    async fn push(&self, path: &Path) -> anyhow::Result<()>;
    /// Open a review (PR) and return its URL.
    async fn open_review(&self, path: &Path, title: &str, body: &str) -> anyhow::Result<String>;
}
