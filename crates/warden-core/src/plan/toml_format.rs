//! TOML format for plan definition files. A plan may be authored
//! offline and loaded in one step instead of built up task-by-task through
//! the API — the fleet-bootstrap pattern of a checked-in plan file reviewed
//! like code.

use serde::{Deserialize, Serialize};

/// Top-level structure of a `plan.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanToml {
    pub plan: PlanMeta,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMeta {
    pub name: String,
    pub base_branch: String,
    /// Total token budget across every worker spawned for this plan. `None`
    /// means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i64>,
}

/// A single `[[tasks]]` entry. `name` is a file-local identifier used only
/// to express `depends_on`; it does not survive into the materialized
/// [`warden_store::models::Task`], which is keyed by UUID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    pub name: String,
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
}

fn default_priority() -> String {
    "normal".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_plan() {
        let toml_str = r#"
[plan]
name = "Add rate limiting"
base_branch = "main"

[[tasks]]
name = "design-middleware"
description = "Sketch the limiter interface"
priority = "normal"
depends_on = []
target_files = ["src/middleware/mod.rs"]

[[tasks]]
name = "implement-limiter"
description = "Implement the token-bucket limiter"
priority = "high"
depends_on = ["design-middleware"]
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.plan.name, "Add rate limiting");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec!["design-middleware"]);
        assert!(plan.tasks[1].target_files.is_empty());
    }

    #[test]
    fn token_budget_defaults_to_none() {
        let toml_str = r#"
[plan]
name = "No budget"
base_branch = "main"
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.plan.token_budget, None);
    }

    #[test]
    fn priority_defaults_to_normal() {
        let toml_str = r#"
[plan]
name = "Defaults"
base_branch = "main"

[[tasks]]
name = "only-task"
description = "d"
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.tasks[0].priority, "normal");
    }

    #[test]
    fn roundtrip_serialize_deserialize() {
        let plan = PlanToml {
            plan: PlanMeta {
                name: "Roundtrip".to_owned(),
                base_branch: "develop".to_owned(),
                token_budget: Some(50_000),
            },
            tasks: vec![TaskToml {
                name: "t1".to_owned(),
                description: "First task".to_owned(),
                priority: "high".to_owned(),
                depends_on: vec![],
                target_files: vec!["a.rs".to_owned()],
            }],
        };
        let serialized = toml::to_string(&plan).expect("should serialize");
        let deserialized: PlanToml = toml::from_str(&serialized).expect("should deserialize");
        assert_eq!(plan, deserialized);
    }
}
