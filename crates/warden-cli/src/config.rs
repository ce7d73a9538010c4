//! Configuration file management for warden.
//!
//! Provides a TOML-based config file at `$XDG_CONFIG_HOME/warden/config.toml`
//! (falling back to `~/.config/warden/config.toml`) and a resolution chain:
//! CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub repo: RepoSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepoSection {
    /// Path to the git repository workers are dispatched against.
    pub path: Option<String>,
    /// Base directory new worktrees are created under. Defaults to
    /// `<repo.path>/.worktrees` when unset.
    pub worktree_base: Option<String>,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            path: None,
            worktree_base: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSection {
    /// Path to the persisted queue state file.
    pub state_path: Option<String>,
    /// Default message TTL, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// Default retry count before a message is marked failed.
    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_retry_count() -> u32 {
    3
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            state_path: None,
            default_ttl_ms: default_ttl_ms(),
            default_retry_count: default_retry_count(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    8787
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_bind_port(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Returns the warden config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/warden` or `~/.config/warden`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("warden");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("warden")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub repo_path: PathBuf,
    pub worktree_base: Option<PathBuf>,
    pub queue_state_path: PathBuf,
    pub plan_store_path: PathBuf,
    pub worktree_registry_path: PathBuf,
    pub bind_addr: String,
    pub bind_port: u16,
    pub default_ttl_ms: u64,
    pub default_retry_count: u32,
}

impl WardenConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - repo path: `cli_repo_path` > `WARDEN_REPO_PATH` env > config file >
    ///   current directory.
    /// - bind addr/port: `WARDEN_BIND_ADDR`/`WARDEN_BIND_PORT` env > config
    ///   file > default.
    pub fn resolve(cli_repo_path: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let repo_path = if let Some(path) = cli_repo_path {
            PathBuf::from(path)
        } else if let Ok(path) = std::env::var("WARDEN_REPO_PATH") {
            PathBuf::from(path)
        } else if let Some(path) = file_config.as_ref().and_then(|c| c.repo.path.clone()) {
            PathBuf::from(path)
        } else {
            std::env::current_dir().context("failed to read current directory")?
        };

        let worktree_base = file_config
            .as_ref()
            .and_then(|c| c.repo.worktree_base.clone())
            .map(PathBuf::from);

        let state_dir = repo_path.join(".warden");

        let queue_state_path = file_config
            .as_ref()
            .and_then(|c| c.queue.state_path.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("queue.json"));

        let bind_addr = std::env::var("WARDEN_BIND_ADDR").ok().unwrap_or_else(|| {
            file_config
                .as_ref()
                .map(|c| c.http.bind_addr.clone())
                .unwrap_or_else(default_bind_addr)
        });

        let bind_port = std::env::var("WARDEN_BIND_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| {
                file_config
                    .as_ref()
                    .map(|c| c.http.bind_port)
                    .unwrap_or_else(default_bind_port)
            });

        let default_ttl_ms = file_config
            .as_ref()
            .map(|c| c.queue.default_ttl_ms)
            .unwrap_or_else(default_ttl_ms);
        let default_retry_count = file_config
            .as_ref()
            .map(|c| c.queue.default_retry_count)
            .unwrap_or_else(default_retry_count);

        Ok(Self {
            plan_store_path: state_dir.join("plans.json"),
            worktree_registry_path: state_dir.join("worktrees.json"),
            queue_state_path,
            repo_path,
            worktree_base,
            bind_addr,
            bind_port,
            default_ttl_ms,
            default_retry_count,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let original = ConfigFile {
            repo: RepoSection {
                path: Some("/tmp/project".to_string()),
                worktree_base: None,
            },
            queue: QueueSection::default(),
            http: HttpSection::default(),
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.repo.path, original.repo.path);
        assert_eq!(loaded.queue.default_retry_count, 3);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let cfg = ConfigFile {
            repo: RepoSection {
                path: Some("/tmp/project".to_string()),
                worktree_base: None,
            },
            queue: QueueSection::default(),
            http: HttpSection::default(),
        };
        save_config(&cfg).unwrap();

        let meta = std::fs::metadata(config_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WARDEN_REPO_PATH", "/from/env") };

        let resolved = WardenConfig::resolve(Some("/from/cli")).unwrap();
        assert_eq!(resolved.repo_path, PathBuf::from("/from/cli"));

        unsafe { std::env::remove_var("WARDEN_REPO_PATH") };
    }

    #[test]
    fn resolve_with_env_var_overrides_default() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WARDEN_REPO_PATH", "/from/env") };

        let resolved = WardenConfig::resolve(None).unwrap();
        assert_eq!(resolved.repo_path, PathBuf::from("/from/env"));

        unsafe { std::env::remove_var("WARDEN_REPO_PATH") };
    }

    #[test]
    fn resolve_defaults_to_current_dir_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("WARDEN_REPO_PATH") };

        let resolved = WardenConfig::resolve(None).unwrap();
        assert_eq!(resolved.repo_path, std::env::current_dir().unwrap());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("warden/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
