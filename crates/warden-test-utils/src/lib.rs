//! Shared test fixtures for orchestration-runtime integration tests.
//!
//! Every subsystem here shells out to the real `git` binary against a
//! temporary repository rather than mocking it, so these helpers build that
//! repository once and hand back a ready-to-use [`TempDir`].

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Create a temporary git repository with an initial commit on `main`.
///
/// Panics on any git failure; this is test-fixture setup, not
/// library code, so failing loudly is correct here.
pub fn create_temp_repo() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    run_git(dir.path(), &["init", "-b", "main"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "user.name", "Test User"]);

    std::fs::write(dir.path().join("README.md"), "# test repo\n").expect("write README");
    run_git(dir.path(), &["add", "-A"]);
    run_git(dir.path(), &["commit", "-m", "initial commit"]);

    dir
}

/// Run a git command in `dir`, panicking on non-zero exit.
pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn git {args:?}: {e}"));

    if !output.status.success() {
        panic!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
}

/// Write `content` to `relative_path` within `dir` and stage + commit it.
pub fn commit_file(dir: &Path, relative_path: &str, content: &str, message: &str) {
    let path = dir.join(relative_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&path, content).expect("write file");
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "-m", message]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_temp_repo_has_initial_commit_on_main() {
        let repo = create_temp_repo();
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "main");
    }
}
