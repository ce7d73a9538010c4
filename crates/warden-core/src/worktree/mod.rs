//! Worktree Manager: creates/destroys per-session git worktrees and
//! persists the `sessionId -> worktree info` map across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, TaxonomyError};
use crate::git::{self, GitError, GitRunner};
use warden_store::models::WorktreeInfo;
use warden_store::worktree_registry::{self, WorktreeRegistryFile};
use warden_store::StoreError;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no worktree registered for session {0}")]
    NotFound(Uuid),
}

impl TaxonomyError for WorktreeError {
    fn kind(&self) -> ErrorKind {
        match self {
            WorktreeError::Git(e) => e.kind(),
            WorktreeError::Store(_) => ErrorKind::TransientIo,
            WorktreeError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateWorktreeOptions {
    pub branch: Option<String>,
    pub path: Option<PathBuf>,
    pub base: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteWorktreeOptions {
    pub commit_message: Option<String>,
    pub allow_empty: bool,
    pub push: bool,
    pub create_pr: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompleteWorktreeResult {
    pub committed: bool,
    pub pushed: bool,
    pub pr_url: Option<String>,
}

pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    registry_path: PathBuf,
    runner: Arc<dyn GitRunner>,
    registry: Mutex<HashMap<Uuid, WorktreeInfo>>,
}

impl WorktreeManager {
    pub async fn load(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
        registry_path: PathBuf,
        runner: Arc<dyn GitRunner>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();
        let worktree_base = worktree_base.unwrap_or_else(|| repo_path.join(".worktrees"));
        let file = worktree_registry::load(&registry_path)?;

        Ok(Self {
            repo_path,
            worktree_base,
            registry_path,
            runner,
            registry: Mutex::new(file.worktrees),
        })
    }

    async fn persist(&self, registry: &HashMap<Uuid, WorktreeInfo>) {
        let file = WorktreeRegistryFile {
            schema_version: warden_store::worktree_registry::SCHEMA_VERSION,
            worktrees: registry.clone(),
        };
        if let Err(e) = worktree_registry::save(&self.registry_path, &file) {
            warn!(error = %e, "failed to persist worktree registry");
        }
    }

    /// Idempotent when an existing worktree path still exists on disk.
    pub async fn create_worktree(
        &self,
        session_id: Uuid,
        opts: CreateWorktreeOptions,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.get(&session_id) {
            if Path::new(&existing.worktree_path).exists() {
                return Ok(existing.clone());
            }
        }

        let branch_name = opts
            .branch
            .unwrap_or_else(|| format!("session/{session_id}"));
        let worktree_path = opts
            .path
            .unwrap_or_else(|| self.worktree_base.join(session_id.to_string()));
        let base_branch = match opts.base {
            Some(base) => base,
            None => git::detect_default_branch(self.runner.as_ref(), &self.repo_path),
        };

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        self.runner.run(
            &self.repo_path,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                &worktree_path.to_string_lossy(),
                &base_branch,
            ],
        )?;

        let info = WorktreeInfo {
            session_id,
            worktree_path: worktree_path.to_string_lossy().into_owned(),
            branch_name,
            base_branch,
            repo_path: self.repo_path.to_string_lossy().into_owned(),
            created_at: chrono::Utc::now(),
        };

        registry.insert(session_id, info.clone());
        self.persist(&registry).await;
        info!(session_id = %session_id, path = %info.worktree_path, "created worktree");
        Ok(info)
    }

    pub async fn get(&self, session_id: Uuid) -> Option<WorktreeInfo> {
        self.registry.lock().await.get(&session_id).cloned()
    }

    pub async fn list(&self) -> Vec<WorktreeInfo> {
        self.registry.lock().await.values().cloned().collect()
    }

    pub async fn complete_worktree(
        &self,
        session_id: Uuid,
        opts: CompleteWorktreeOptions,
    ) -> Result<CompleteWorktreeResult, WorktreeError> {
        let info = self
            .get(session_id)
            .await
            .ok_or(WorktreeError::NotFound(session_id))?;
        let path = PathBuf::from(&info.worktree_path);

        self.runner.run(&path, &["add", "-A"])?;

        let mut result = CompleteWorktreeResult::default();
        let dirty = git::has_uncommitted_changes(self.runner.as_ref(), &path)?;
        if dirty || opts.allow_empty {
            let message = opts
                .commit_message
                .unwrap_or_else(|| "Automated commit from worker session".to_string());
            let mut args = vec!["commit", "-m", message.as_str()];
            if opts.allow_empty {
                args.push("--allow-empty");
            }
            self.runner.run(&path, &args)?;
            result.committed = true;
        }

        if opts.push {
            self.runner
                .run(&path, &["push", "--set-upstream", "origin", &info.branch_name])?;
            result.pushed = true;
        }

        if opts.create_pr {
            if let Ok(output) = self.runner.run(
                &path,
                &["pr", "create", "--fill", "--base", &info.base_branch],
            ) {
                result.pr_url = parse_pr_url(&output.stdout);
            }
        }

        Ok(result)
    }

    /// Removes the local map entry regardless of the outcome of the
    /// underlying git operations.
    pub async fn remove_worktree(&self, session_id: Uuid) -> Result<(), WorktreeError> {
        let info = self.get(session_id).await;

        if let Some(info) = &info {
            let path = &info.worktree_path;
            let primary = self
                .runner
                .run(&self.repo_path, &["worktree", "remove", path]);
            if primary.is_err() {
                let fallback =
                    self.runner
                        .run(&self.repo_path, &["worktree", "remove", "--force", path]);
                if let Err(e) = fallback {
                    warn!(session_id = %session_id, error = %e, "git worktree remove failed");
                }
            }
            if let Err(e) = self
                .runner
                .run(&self.repo_path, &["branch", "-D", &info.branch_name])
            {
                warn!(session_id = %session_id, error = %e, "best-effort branch delete failed");
            }
        }

        let mut registry = self.registry.lock().await;
        registry.remove(&session_id);
        self.persist(&registry).await;
        Ok(())
    }
}

fn parse_pr_url(text: &str) -> Option<String> {
    let re_prefix = "https://github.com/";
    text.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with(re_prefix) && line.contains("/pull/") {
            Some(line.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::SystemGitRunner;
    use warden_test_utils::create_temp_repo;

    #[tokio::test]
    async fn create_worktree_registers_and_persists() {
        let repo = create_temp_repo();
        let session_id = Uuid::new_v4();
        let registry_dir = tempfile::tempdir().unwrap();
        let registry_path = registry_dir.path().join("worktrees.json");

        let manager = WorktreeManager::load(
            repo.path().to_path_buf(),
            None,
            registry_path.clone(),
            Arc::new(SystemGitRunner),
        )
        .await
        .unwrap();

        let info = manager
            .create_worktree(session_id, CreateWorktreeOptions::default())
            .await
            .unwrap();

        assert!(Path::new(&info.worktree_path).exists());
        assert_eq!(info.branch_name, format!("session/{session_id}"));

        let reloaded = WorktreeManager::load(
            repo.path().to_path_buf(),
            None,
            registry_path,
            Arc::new(SystemGitRunner),
        )
        .await
        .unwrap();
        assert!(reloaded.get(session_id).await.is_some());
    }

    #[tokio::test]
    async fn remove_worktree_clears_registry_entry_even_if_git_fails() {
        let repo = create_temp_repo();
        let session_id = Uuid::new_v4();
        let registry_dir = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::load(
            repo.path().to_path_buf(),
            None,
            registry_dir.path().join("worktrees.json"),
            Arc::new(SystemGitRunner),
        )
        .await
        .unwrap();

        manager
            .create_worktree(session_id, CreateWorktreeOptions::default())
            .await
            .unwrap();
        manager.remove_worktree(session_id).await.unwrap();
        assert!(manager.get(session_id).await.is_none());
    }
}
