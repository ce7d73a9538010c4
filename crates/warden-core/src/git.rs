//! Git primitives: a typed wrapper around the subset of git commands
//! the worktree and completion managers need, returning structured results
//! instead of raw process output.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{ErrorKind, TaxonomyError};

/// 10 MiB cap on captured stdout/stderr.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git {args:?}: {source}")]
    Spawn {
        args: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("git {args:?} exited {code} in {cwd}: {stderr}")]
    NonZeroExit {
        args: Vec<String>,
        code: i32,
        cwd: String,
        stderr: String,
    },
}

impl TaxonomyError for GitError {
    fn kind(&self) -> ErrorKind {
        match self {
            GitError::Spawn { .. } => ErrorKind::TransientIo,
            GitError::NonZeroExit { .. } => ErrorKind::TransientIo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitResult {
    pub stdout: String,
    pub stderr: String,
}

/// Runs git subprocesses with a fixed working directory, capturing and
/// capping output. Trait-ified so worktree/completion code can be tested
/// against a fake that never touches a real repository.
pub trait GitRunner: Send + Sync {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitResult, GitError>;

    /// Like `run`, but a non-zero exit is not an error — used for commands
    /// whose exit code is itself meaningful (e.g. probing for a branch).
    fn run_allow_failure(&self, cwd: &Path, args: &[&str]) -> Result<(bool, GitResult), GitError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGitRunner;

impl SystemGitRunner {
    fn exec(cwd: &Path, args: &[&str]) -> Result<(bool, GitResult), GitError> {
        debug!(cwd = %cwd.display(), args = ?args, "running git");
        let output: Output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| GitError::Spawn {
                args: args.iter().map(|s| s.to_string()).collect(),
                source: e,
            })?;

        let mut stdout = output.stdout;
        let mut stderr = output.stderr;
        stdout.truncate(MAX_OUTPUT_BYTES);
        stderr.truncate(MAX_OUTPUT_BYTES);

        let success = output.status.success();
        if !success {
            warn!(cwd = %cwd.display(), args = ?args, code = ?output.status.code(), "git exited non-zero");
        }

        Ok((
            success,
            GitResult {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            },
        ))
    }
}

impl GitRunner for SystemGitRunner {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitResult, GitError> {
        let (success, result) = Self::exec(cwd, args)?;
        if !success {
            return Err(GitError::NonZeroExit {
                args: args.iter().map(|s| s.to_string()).collect(),
                code: -1,
                cwd: cwd.display().to_string(),
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    fn run_allow_failure(&self, cwd: &Path, args: &[&str]) -> Result<(bool, GitResult), GitError> {
        Self::exec(cwd, args)
    }
}

/// Detect the repository's default branch: `origin/HEAD` symbolic ref, else
/// `main` if it exists, else `master`.
pub fn detect_default_branch(runner: &dyn GitRunner, repo_path: &Path) -> String {
    if let Ok(result) = runner.run(repo_path, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = result.stdout.trim().rsplit('/').next() {
            if !branch.is_empty() {
                return branch.to_string();
            }
        }
    }

    if let Ok((exists, _)) = runner.run_allow_failure(
        repo_path,
        &["show-ref", "--verify", "--quiet", "refs/heads/main"],
    ) {
        if exists {
            return "main".to_string();
        }
    }

    "master".to_string()
}

pub fn is_worktree(runner: &dyn GitRunner, path: &Path) -> bool {
    runner
        .run(path, &["rev-parse", "--is-inside-work-tree"])
        .map(|r| r.stdout.trim() == "true")
        .unwrap_or(false)
}

pub fn has_uncommitted_changes(runner: &dyn GitRunner, path: &Path) -> Result<bool, GitError> {
    let result = runner.run(path, &["status", "--porcelain"])?;
    Ok(!result.stdout.trim().is_empty())
}

pub fn conflicted_files(runner: &dyn GitRunner, path: &Path) -> Result<Vec<String>, GitError> {
    let result = runner.run(path, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(result
        .stdout
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

pub fn file_exists_in_worktree(path: &Path, relative: &str) -> bool {
    path.join(relative).exists()
}

pub fn marker_exists(path: &Path, name: &str) -> bool {
    path.join(".git").join(name).exists()
}

pub fn current_branch(runner: &dyn GitRunner, path: &Path) -> Result<String, GitError> {
    let result = runner.run(path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(result.stdout.trim().to_string())
}

pub fn current_head(runner: &dyn GitRunner, path: &Path) -> Result<String, GitError> {
    let result = runner.run(path, &["rev-parse", "HEAD"])?;
    Ok(result.stdout.trim().to_string())
}

pub fn worktree_list(runner: &dyn GitRunner, repo_path: &Path) -> Result<Vec<PathBuf>, GitError> {
    let result = runner.run(repo_path, &["worktree", "list", "--porcelain"])?;
    Ok(result
        .stdout
        .lines()
        .filter_map(|l| l.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect())
}
