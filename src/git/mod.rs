//! Worktree provisioning (spec §4.6 step 9, §4.11 step 3, §4.12 teardown
//! step 5).
//!
//! Grounded in the teacher's `crates/ccswarm/src/git/shell.rs`
//! (`ShellWorktreeManager`, shell `git worktree` commands) and
//! `original_source/src/managers/worktree_manager.py`, which prefers `gtr
//! new` when `git-worktree-runner` is on PATH and otherwise falls back to
//! native `git worktree add/remove/list --porcelain`. Both backends
//! implement [`WorktreeProvisioner`] so the batch engine and healthcheck
//! recovery path don't care which one ran.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
}

#[async_trait]
pub trait WorktreeProvisioner: Send + Sync {
    async fn create_worktree(&self, path: &Path, branch: &str, base_branch: &str) -> Result<WorktreeInfo>;
    async fn remove_worktree(&self, path: &Path) -> Result<()>;
    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>>;
}

/// `git worktree add/remove/list --porcelain`, grounded in
/// `crates/ccswarm/src/git/shell.rs::ShellWorktreeManager`.
pub struct ShellWorktreeManager {
    repo_path: PathBuf,
}

impl ShellWorktreeManager {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    pub async fn is_git_repo(path: &Path) -> bool {
        Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(path)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| FleetError::WorktreeFailed(format!("git exec failed: {e}")))?;
        if !output.status.success() {
            return Err(FleetError::WorktreeFailed(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_porcelain(listing: &str) -> Vec<WorktreeInfo> {
        let mut out = Vec::new();
        let mut path: Option<PathBuf> = None;
        let mut head = String::new();
        let mut branch = String::new();
        for line in listing.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                if let Some(path) = path.take() {
                    out.push(WorktreeInfo {
                        path,
                        branch: std::mem::take(&mut branch),
                        head_commit: std::mem::take(&mut head),
                    });
                }
                path = Some(PathBuf::from(p));
            } else if let Some(h) = line.strip_prefix("HEAD ") {
                head = h.to_string();
            } else if let Some(b) = line.strip_prefix("branch ") {
                branch = b.trim_start_matches("refs/heads/").to_string();
            }
        }
        if let Some(path) = path {
            out.push(WorktreeInfo {
                path,
                branch,
                head_commit: head,
            });
        }
        out
    }
}

#[async_trait]
impl WorktreeProvisioner for ShellWorktreeManager {
    async fn create_worktree(&self, path: &Path, branch: &str, base_branch: &str) -> Result<WorktreeInfo> {
        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "add", "-b", branch, &path_str, base_branch])
            .await?;
        let head = self
            .run(&["rev-parse", "HEAD"])
            .await
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(WorktreeInfo {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            head_commit: head,
        })
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "remove", "--force", &path_str]).await?;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let out = self.run(&["worktree", "list", "--porcelain"]).await?;
        Ok(Self::parse_porcelain(&out))
    }
}

/// `gtr new <branch> --from <base_branch>` backend, used when `gtr` is
/// detected on PATH (§4.6 step 9, §4.12 step 6 "gtr detection").
pub struct GtrWorktreeManager {
    repo_path: PathBuf,
}

impl GtrWorktreeManager {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    pub async fn is_available() -> bool {
        Command::new("git")
            .args(["gtr", "--version"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl WorktreeProvisioner for GtrWorktreeManager {
    async fn create_worktree(&self, path: &Path, branch: &str, base_branch: &str) -> Result<WorktreeInfo> {
        let output = Command::new("git")
            .args(["gtr", "new", branch, "--from", base_branch])
            .current_dir(&self.repo_path)
            .output()
            .await
            .map_err(|e| FleetError::WorktreeFailed(format!("gtr exec failed: {e}")))?;
        if !output.status.success() {
            return Err(FleetError::WorktreeFailed(format!(
                "gtr new failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(WorktreeInfo {
            path: path.to_path_buf(),
            branch: branch.to_string(),
            head_commit: String::new(),
        })
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let shell = ShellWorktreeManager::new(self.repo_path.clone());
        shell.remove_worktree(path).await
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let shell = ShellWorktreeManager::new(self.repo_path.clone());
        shell.list_worktrees().await
    }
}

/// Strips a trailing `feature/` prefix from `base_branch` before appending
/// `-worker-{n}-{task_id}`, then re-adds a single `feature/` prefix (spec
/// §4.6 step 8): `feature/x` + worker 3 + task `T` ⇒ `feature/x-worker-3-T`.
pub fn build_worker_task_branch(base_branch: &str, worker_no: usize, task_id: &str) -> String {
    let stripped = base_branch.strip_prefix("feature/").unwrap_or(base_branch);
    format!("feature/{stripped}-worker-{worker_no}-{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_never_duplicates_feature_prefix() {
        assert_eq!(
            build_worker_task_branch("feature/x", 3, "T1"),
            "feature/x-worker-3-T1"
        );
        assert_eq!(
            build_worker_task_branch("main", 1, "T2"),
            "feature/main-worker-1-T2"
        );
    }

    #[test]
    fn porcelain_listing_parses_multiple_worktrees() {
        let listing = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\nworktree /repo/.worktrees/feature-x\nHEAD def456\nbranch refs/heads/feature/x\n";
        let parsed = ShellWorktreeManager::parse_porcelain(listing);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].branch, "main");
        assert_eq!(parsed[1].branch, "feature/x");
        assert_eq!(parsed[1].path, PathBuf::from("/repo/.worktrees/feature-x"));
    }
}
