//! Turning a parsed [`PlanToml`] into store-ready [`Plan`]/[`Task`] rows.
//!
//! Loading a plan file validates that every `depends_on` name resolves
//! within the same file and that the resulting dependency graph is acyclic;
//! both failures are [`ValidationError`]s and materialize nothing.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorKind, TaxonomyError};
use warden_store::models::{Plan, PlanStatus, Priority, Task, TaskStatus};

use super::toml_format::PlanToml;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("duplicate task name {0} in plan")]
    DuplicateTaskName(String),
    #[error("dependency graph contains a cycle involving task {0}")]
    CyclicDependency(String),
    #[error("invalid priority {0:?} for task {1}")]
    InvalidPriority(String, String),
}

impl TaxonomyError for ValidationError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Materializes a parsed plan file into a [`Plan`] and its [`Task`]s,
/// resolving `depends_on` names to freshly assigned task UUIDs.
///
/// Validates fully before constructing anything: on any [`ValidationError`]
/// the caller receives no partial plan or tasks.
pub fn materialize_plan(toml: PlanToml) -> Result<(Plan, Vec<Task>), ValidationError> {
    let mut name_to_id: HashMap<&str, Uuid> = HashMap::new();
    for task in &toml.tasks {
        if name_to_id
            .insert(task.name.as_str(), Uuid::new_v4())
            .is_some()
        {
            return Err(ValidationError::DuplicateTaskName(task.name.clone()));
        }
    }

    for task in &toml.tasks {
        for dep in &task.depends_on {
            if !name_to_id.contains_key(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    assert_acyclic(&toml, &name_to_id)?;

    let now = Utc::now();
    let plan_id = Uuid::new_v4();
    let plan = Plan {
        id: plan_id,
        name: toml.plan.name,
        base_branch: toml.plan.base_branch,
        token_budget: toml.plan.token_budget,
        status: PlanStatus::New,
        created_at: now,
    };

    let mut tasks = Vec::with_capacity(toml.tasks.len());
    for task in &toml.tasks {
        let priority: Priority = task
            .priority
            .parse()
            .map_err(|_| ValidationError::InvalidPriority(task.priority.clone(), task.name.clone()))?;
        let dependencies = task
            .depends_on
            .iter()
            .map(|dep| name_to_id[dep.as_str()])
            .collect();

        tasks.push(Task {
            id: name_to_id[task.name.as_str()],
            name: Some(task.name.clone()),
            description: task.description.clone(),
            priority,
            plan_id: Some(plan_id),
            dependencies,
            parallel_group: None,
            agent: None,
            model_id: None,
            target_files: task.target_files.clone(),
            base_branch: None,
            worker_id: None,
            session_uri: None,
            status: TaskStatus::Pending,
            created_at: now,
        });
    }

    Ok((plan, tasks))
}

/// DFS-based cycle detection over `depends_on` edges, by name so the error
/// message is readable before any UUID exists.
fn assert_acyclic(
    toml: &PlanToml,
    name_to_id: &HashMap<&str, Uuid>,
) -> Result<(), ValidationError> {
    let by_name: HashMap<&str, &super::toml_format::TaskToml> =
        toml.tasks.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut visiting: HashSet<&str> = HashSet::new();
    let mut done: HashSet<&str> = HashSet::new();

    for task in &toml.tasks {
        visit(task.name.as_str(), &by_name, &mut visiting, &mut done)?;
    }
    let _ = name_to_id;
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    by_name: &HashMap<&'a str, &'a super::toml_format::TaskToml>,
    visiting: &mut HashSet<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<(), ValidationError> {
    if done.contains(name) {
        return Ok(());
    }
    if !visiting.insert(name) {
        return Err(ValidationError::CyclicDependency(name.to_string()));
    }
    if let Some(task) = by_name.get(name) {
        for dep in &task.depends_on {
            visit(dep.as_str(), by_name, visiting, done)?;
        }
    }
    visiting.remove(name);
    done.insert(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::toml_format::{PlanMeta, TaskToml};

    fn toml_with_tasks(tasks: Vec<TaskToml>) -> PlanToml {
        PlanToml {
            plan: PlanMeta {
                name: "p".to_string(),
                base_branch: "main".to_string(),
                token_budget: None,
            },
            tasks,
        }
    }

    fn task(name: &str, depends_on: Vec<&str>) -> TaskToml {
        TaskToml {
            name: name.to_string(),
            description: "d".to_string(),
            priority: "normal".to_string(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            target_files: vec![],
        }
    }

    #[test]
    fn materializes_diamond_dag() {
        let toml = toml_with_tasks(vec![
            task("a", vec![]),
            task("b", vec!["a"]),
            task("c", vec!["a"]),
            task("d", vec!["b", "c"]),
        ]);
        let (plan, tasks) = materialize_plan(toml).unwrap();
        assert_eq!(plan.status, PlanStatus::New);
        assert_eq!(tasks.len(), 4);
        let d = tasks.iter().find(|t| t.name.as_deref() == Some("d")).unwrap();
        assert_eq!(d.dependencies.len(), 2);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let toml = toml_with_tasks(vec![task("a", vec!["ghost"])]);
        let err = materialize_plan(toml).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );
    }

    #[test]
    fn rejects_duplicate_task_name() {
        let toml = toml_with_tasks(vec![task("a", vec![]), task("a", vec![])]);
        let err = materialize_plan(toml).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateTaskName("a".to_string()));
    }

    #[test]
    fn rejects_cycle() {
        let toml = toml_with_tasks(vec![task("a", vec!["b"]), task("b", vec!["a"])]);
        let err = materialize_plan(toml).unwrap_err();
        assert!(matches!(err, ValidationError::CyclicDependency(_)));
    }

    #[test]
    fn rejects_invalid_priority() {
        let mut t = task("a", vec![]);
        t.priority = "urgent".to_string();
        let err = materialize_plan(toml_with_tasks(vec![t])).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPriority(_, _)));
    }
}
