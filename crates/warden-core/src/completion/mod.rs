//! Completion / Merge Engine: pre-merge checks, conflict detection,
//! merge strategies, conflict resolution, and worktree cleanup.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::error::{ErrorKind, TaxonomyError};
use crate::git::{self, GitError, GitRunner};

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("{0} is not a git worktree")]
    NotAWorktree(String),
    #[error("stash failed, aborting cleanup: {0}")]
    StashFailed(String),
}

impl TaxonomyError for CompletionError {
    fn kind(&self) -> ErrorKind {
        match self {
            CompletionError::Git(e) => e.kind(),
            CompletionError::NotAWorktree(_) => ErrorKind::Validation,
            CompletionError::StashFailed(_) => ErrorKind::Conflict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    Merge,
    Rebase,
    Uncommitted,
    Diverged,
}

#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub has_conflicts: bool,
    pub conflict_type: Option<ConflictType>,
    pub files: Vec<String>,
}

impl ConflictInfo {
    fn none() -> Self {
        Self {
            has_conflicts: false,
            conflict_type: None,
            files: Vec::new(),
        }
    }

    /// Only `merge`, `rebase`, and `diverged` block a merge; `uncommitted`
    /// is surfaced as a warning instead.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self.conflict_type,
            Some(ConflictType::Merge) | Some(ConflictType::Rebase) | Some(ConflictType::Diverged)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreMergeCheck {
    pub can_merge: bool,
    pub conflicts: Option<ConflictInfo>,
    pub source_branch_exists: bool,
    pub target_branch_exists: bool,
    pub is_clean_working_tree: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub abort_on_conflict: bool,
    pub auto_commit: bool,
    pub commit_message: String,
    pub push: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Squash,
            abort_on_conflict: true,
            auto_commit: true,
            commit_message: "Merge branch".to_string(),
            push: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub success: bool,
    pub has_conflicts: bool,
    pub conflicting_files: Vec<String>,
    pub head: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Ours,
    Theirs,
}

pub struct CompletionEngine {
    runner: Arc<dyn GitRunner>,
}

impl CompletionEngine {
    pub fn new(runner: Arc<dyn GitRunner>) -> Self {
        Self { runner }
    }

    fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
        self.runner
            .run_allow_failure(
                repo,
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
            )
            .map(|(exists, _)| exists)
            .unwrap_or(false)
    }

    /// Runs the ordered conflict checks: in-progress merge, then
    /// in-progress rebase, then uncommitted changes, then divergence, then
    /// (only if none of the above apply) a dry-run merge.
    pub fn detect_conflicts(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<ConflictInfo, CompletionError> {
        if git::marker_exists(repo, "MERGE_HEAD") {
            return Ok(ConflictInfo {
                has_conflicts: true,
                conflict_type: Some(ConflictType::Merge),
                files: git::conflicted_files(self.runner.as_ref(), repo)?,
            });
        }
        if git::marker_exists(repo, "REBASE_HEAD") {
            return Ok(ConflictInfo {
                has_conflicts: true,
                conflict_type: Some(ConflictType::Rebase),
                files: git::conflicted_files(self.runner.as_ref(), repo)?,
            });
        }
        if git::has_uncommitted_changes(self.runner.as_ref(), repo)? {
            let result = self.runner.run(repo, &["status", "--porcelain"])?;
            let files = result
                .stdout
                .lines()
                .filter_map(|l| l.get(3..).map(str::to_string))
                .collect();
            return Ok(ConflictInfo {
                has_conflicts: true,
                conflict_type: Some(ConflictType::Uncommitted),
                files,
            });
        }

        let merge_base = self
            .runner
            .run_allow_failure(repo, &["merge-base", source, target])?;
        if !merge_base.0 || merge_base.1.stdout.trim().is_empty() {
            return Ok(ConflictInfo {
                has_conflicts: true,
                conflict_type: Some(ConflictType::Diverged),
                files: Vec::new(),
            });
        }

        self.dry_run_merge(repo, source)
    }

    fn dry_run_merge(&self, repo: &Path, source: &str) -> Result<ConflictInfo, CompletionError> {
        let original_branch = git::current_branch(self.runner.as_ref(), repo)?;
        let (_, result) = self
            .runner
            .run_allow_failure(repo, &["merge", "--no-commit", "--no-ff", source])?;
        self.runner.run(repo, &["merge", "--abort"]).ok();
        // Always restore the original branch regardless of outcome.
        self.runner.run(repo, &["checkout", &original_branch]).ok();

        let files = parse_conflict_files(&result.stdout);
        if files.is_empty() {
            Ok(ConflictInfo::none())
        } else {
            Ok(ConflictInfo {
                has_conflicts: true,
                conflict_type: Some(ConflictType::Merge),
                files,
            })
        }
    }

    pub fn pre_merge_check(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<PreMergeCheck, CompletionError> {
        let mut check = PreMergeCheck {
            source_branch_exists: self.branch_exists(repo, source),
            target_branch_exists: self.branch_exists(repo, target),
            ..Default::default()
        };

        if !check.source_branch_exists {
            check.errors.push(format!("source branch {source} does not exist"));
        }
        if !check.target_branch_exists {
            check.errors.push(format!("target branch {target} does not exist"));
        }

        if check.errors.is_empty() {
            let conflicts = self.detect_conflicts(repo, source, target)?;
            check.is_clean_working_tree = !matches!(
                conflicts.conflict_type,
                Some(ConflictType::Uncommitted)
            );
            if let Some(ConflictType::Uncommitted) = conflicts.conflict_type {
                check.warnings.push("working tree has uncommitted changes".to_string());
            }
            let blocking = conflicts.is_blocking();
            check.conflicts = Some(conflicts);
            check.can_merge = !blocking;
        } else {
            check.can_merge = false;
        }

        Ok(check)
    }

    pub fn merge_branches(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
        options: MergeOptions,
    ) -> Result<MergeOutcome, CompletionError> {
        let original_branch = git::current_branch(self.runner.as_ref(), repo)?;
        self.runner.run(repo, &["checkout", target])?;

        let (_, result) = match options.strategy {
            MergeStrategy::Squash => {
                let (ok, out) = self.runner.run_allow_failure(repo, &["merge", "--squash", source])?;
                if ok && options.auto_commit {
                    self.runner
                        .run(repo, &["commit", "-m", &options.commit_message])?;
                }
                (ok, out)
            }
            MergeStrategy::Merge => self.runner.run_allow_failure(
                repo,
                &["merge", source, "-m", &options.commit_message, "--no-ff"],
            )?,
            MergeStrategy::Rebase => self.runner.run_allow_failure(repo, &["rebase", source])?,
        };

        let conflict_markers = result.stdout.contains("CONFLICT")
            || result.stdout.contains("Automatic merge failed")
            || result.stderr.contains("CONFLICT");

        if conflict_markers {
            let conflicting_files = git::conflicted_files(self.runner.as_ref(), repo).unwrap_or_default();
            if options.abort_on_conflict {
                let abort_cmd = match options.strategy {
                    MergeStrategy::Rebase => "rebase",
                    _ => "merge",
                };
                self.runner.run(repo, &[abort_cmd, "--abort"]).ok();
                self.runner.run(repo, &["checkout", &original_branch]).ok();
            }
            return Ok(MergeOutcome {
                success: false,
                has_conflicts: true,
                conflicting_files,
                head: None,
                error: None,
            });
        }

        let head = git::current_head(self.runner.as_ref(), repo).ok();

        if options.push {
            if let Err(e) = self.runner.run(repo, &["push", "origin", target]) {
                warn!(error = %e, "push after successful merge failed");
                return Ok(MergeOutcome {
                    success: true,
                    has_conflicts: false,
                    conflicting_files: Vec::new(),
                    head,
                    error: Some(format!("push failed: {e}")),
                });
            }
        }

        info!(source, target, ?options.strategy, "merge succeeded");
        Ok(MergeOutcome {
            success: true,
            has_conflicts: false,
            conflicting_files: Vec::new(),
            head,
            error: None,
        })
    }

    /// `git checkout --{strategy} -- <files>` then stage all. No-op success
    /// when `files` is empty.
    pub fn resolve_all_conflicts(
        &self,
        repo: &Path,
        files: &[String],
        strategy: ResolutionStrategy,
    ) -> Result<(), CompletionError> {
        if files.is_empty() {
            return Ok(());
        }
        let flag = match strategy {
            ResolutionStrategy::Ours => "--ours",
            ResolutionStrategy::Theirs => "--theirs",
        };
        let mut args = vec!["checkout", flag, "--"];
        args.extend(files.iter().map(String::as_str));
        self.runner.run(repo, &args)?;
        self.runner.run(repo, &["add", "-A"])?;
        Ok(())
    }

    pub fn cleanup_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        force: bool,
        delete_branch: Option<&str>,
    ) -> Result<(), CompletionError> {
        if !git::is_worktree(self.runner.as_ref(), worktree_path) {
            return Err(CompletionError::NotAWorktree(
                worktree_path.display().to_string(),
            ));
        }

        let dirty = git::has_uncommitted_changes(self.runner.as_ref(), worktree_path)?;
        if dirty && !force {
            let (ok, result) = self.runner.run_allow_failure(
                worktree_path,
                &["stash", "push", "-u", "-m", "Auto-stash before worktree removal"],
            )?;
            if !ok {
                return Err(CompletionError::StashFailed(result.stderr));
            }
        }

        self.runner
            .run(repo, &["worktree", "remove", &worktree_path.to_string_lossy()])
            .or_else(|_| {
                self.runner.run(
                    repo,
                    &["worktree", "remove", "--force", &worktree_path.to_string_lossy()],
                )
            })?;

        if let Some(branch) = delete_branch {
            self.runner.run(repo, &["branch", "-D", branch]).ok();
        }

        Ok(())
    }
}

fn parse_conflict_files(merge_output: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in merge_output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("CONFLICT (content): Merge conflict in ") {
            push_unique(&mut files, rest);
        } else if let Some(rest) = line.strip_prefix("CONFLICT (modify/delete): ") {
            if let Some(file) = rest.split(" deleted").next() {
                push_unique(&mut files, file.trim());
            }
        } else if line.starts_with("Auto-merging") && line.contains("conflict") {
            if let Some(file) = line.strip_prefix("Auto-merging ") {
                push_unique(&mut files, file.trim());
            }
        }
    }
    files
}

fn push_unique(files: &mut Vec<String>, file: &str) {
    if !files.iter().any(|f| f == file) {
        files.push(file.to_string());
    }
}
