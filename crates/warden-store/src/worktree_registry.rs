//! On-disk format for the worktree manager's `sessionId -> WorktreeInfo`
//! registry, so worktrees survive process restarts.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic::{self, StoreError};
use crate::models::WorktreeInfo;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeRegistryFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub worktrees: HashMap<Uuid, WorktreeInfo>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for WorktreeRegistryFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            worktrees: HashMap::new(),
        }
    }
}

pub fn save(path: &Path, registry: &WorktreeRegistryFile) -> Result<(), StoreError> {
    atomic::write_json_atomic(path, registry)
}

pub fn load(path: &Path) -> Result<WorktreeRegistryFile, StoreError> {
    Ok(atomic::read_json(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worktrees.json");
        let session_id = Uuid::new_v4();

        let mut registry = WorktreeRegistryFile::default();
        registry.worktrees.insert(
            session_id,
            WorktreeInfo {
                session_id,
                worktree_path: "/tmp/foo".to_string(),
                branch_name: "session/foo".to_string(),
                base_branch: "main".to_string(),
                repo_path: "/tmp/repo".to_string(),
                created_at: chrono::Utc::now(),
            },
        );

        save(&path, &registry).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.worktrees.len(), 1);
        assert_eq!(
            loaded.worktrees.get(&session_id).unwrap().branch_name,
            "session/foo"
        );
    }
}
