//! On-disk format for plans and tasks.
//!
//! The source system keeps this in a relational database; this runtime is
//! single-host and file-backed, so
//! plans and tasks live in one atomically-replaced JSON document alongside
//! the queue and worktree state.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atomic::{self, StoreError};
use crate::models::{Plan, Task};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStoreFile {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub plans: HashMap<Uuid, Plan>,
    pub tasks: HashMap<Uuid, Task>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for PlanStoreFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            plans: HashMap::new(),
            tasks: HashMap::new(),
        }
    }
}

impl PlanStoreFile {
    pub fn tasks_for_plan(&self, plan_id: Uuid) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.plan_id == Some(plan_id))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}

pub fn save(path: &Path, store: &PlanStoreFile) -> Result<(), StoreError> {
    atomic::write_json_atomic(path, store)
}

pub fn load(path: &Path) -> Result<PlanStoreFile, StoreError> {
    Ok(atomic::read_json(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanStatus, TaskStatus};

    fn sample_plan() -> Plan {
        Plan {
            id: Uuid::new_v4(),
            name: "demo".to_string(),
            base_branch: "main".to_string(),
            token_budget: None,
            status: PlanStatus::New,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn tasks_for_plan_filters_and_sorts() {
        let plan = sample_plan();
        let mut store = PlanStoreFile::default();

        let t1 = Task {
            id: Uuid::new_v4(),
            name: Some("first".into()),
            description: "d".into(),
            priority: crate::models::Priority::Normal,
            plan_id: Some(plan.id),
            dependencies: vec![],
            parallel_group: None,
            agent: None,
            model_id: None,
            target_files: vec![],
            base_branch: None,
            worker_id: None,
            session_uri: None,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now(),
        };
        let mut t2 = t1.clone();
        t2.id = Uuid::new_v4();
        t2.name = Some("second".into());
        t2.created_at = t1.created_at + chrono::Duration::seconds(1);

        let other_plan_task = Task {
            plan_id: Some(Uuid::new_v4()),
            ..t1.clone()
        };

        store.plans.insert(plan.id, plan.clone());
        store.tasks.insert(t1.id, t1.clone());
        store.tasks.insert(t2.id, t2.clone());
        store.tasks.insert(other_plan_task.id, other_plan_task);

        let tasks = store.tasks_for_plan(plan.id);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name.as_deref(), Some("first"));
        assert_eq!(tasks[1].name.as_deref(), Some("second"));
    }
}
