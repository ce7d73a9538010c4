//! Parsing `plan.toml` text into [`PlanToml`], with no further validation —
//! structural validation (name resolution, acyclicity) lives in
//! [`crate::plan::materialize`].

use thiserror::Error;

use crate::error::{ErrorKind, TaxonomyError};

use super::toml_format::PlanToml;

#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("failed to parse plan TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl TaxonomyError for PlanParseError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

pub fn parse_plan_toml(content: &str) -> Result<PlanToml, PlanParseError> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_toml() {
        let err = parse_plan_toml("not = [valid").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn parses_well_formed_toml() {
        let plan = parse_plan_toml(
            r#"
[plan]
name = "p"
base_branch = "main"
"#,
        )
        .unwrap();
        assert_eq!(plan.plan.name, "p");
    }
}
