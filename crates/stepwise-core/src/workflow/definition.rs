//! Workflow definition parsing and structural validation.
//!
//! Converts YAML files into the canonical `WorkflowDefinition` and checks the
//! invariants an activated definition must satisfy (at least one step, unique
//! ids and sequences, resolvable links, exactly one default per condition
//! step, positive approval timeouts).

use std::collections::HashSet;
use std::path::Path;

use stepwise_types::workflow::{StepConfig, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

fn invalid(message: String) -> DefinitionError {
    DefinitionError::ValidationError(message)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load and validate a definition from a YAML file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Serialize a definition back to YAML.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.code.trim().is_empty() {
        return Err(invalid("definition code must not be empty".to_string()));
    }
    if def.steps.is_empty() {
        return Err(invalid(format!(
            "definition '{}' must have at least one step",
            def.code
        )));
    }

    let mut ids = HashSet::new();
    let mut sequences = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(invalid("step id must not be empty".to_string()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(format!("duplicate step id: '{}'", step.id)));
        }
        if !sequences.insert(step.sequence) {
            return Err(invalid(format!(
                "duplicate sequence {} (step '{}')",
                step.sequence, step.id
            )));
        }
    }

    for step in &def.steps {
        if let Some(next) = &step.next {
            if !ids.contains(next.as_str()) {
                return Err(invalid(format!(
                    "step '{}' links to unknown step '{}'",
                    step.id, next
                )));
            }
        }

        match &step.config {
            StepConfig::Action(action) => {
                if action.handler.trim().is_empty() {
                    return Err(invalid(format!(
                        "action step '{}' must name a handler",
                        step.id
                    )));
                }
            }
            StepConfig::Condition(cfg) => {
                if cfg.conditions.is_empty() {
                    return Err(invalid(format!(
                        "condition step '{}' has no conditions",
                        step.id
                    )));
                }
                let defaults = cfg.conditions.iter().filter(|c| c.is_default).count();
                if defaults != 1 {
                    return Err(invalid(format!(
                        "condition step '{}' must have exactly one default condition, found {defaults}",
                        step.id
                    )));
                }
                for condition in &cfg.conditions {
                    if let Some(target) = &condition.next_step {
                        if !ids.contains(target.as_str()) {
                            return Err(invalid(format!(
                                "condition step '{}' branches to unknown step '{}'",
                                step.id, target
                            )));
                        }
                    }
                    if !condition.is_default && condition.field.trim().is_empty() {
                        return Err(invalid(format!(
                            "condition {} of step '{}' has no field",
                            condition.sequence, step.id
                        )));
                    }
                }
            }
            StepConfig::Approval(_) => {
                if step.timeout_secs.is_none_or(|t| t == 0) {
                    return Err(invalid(format!(
                        "approval step '{}' needs a positive timeout_secs",
                        step.id
                    )));
                }
            }
            StepConfig::Notification(cfg) => {
                if cfg.channel.trim().is_empty() {
                    return Err(invalid(format!(
                        "notification step '{}' must name a channel",
                        step.id
                    )));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
name: Purchase order
code: purchase-order
target_entity_type: purchase_order
steps:
  - id: route
    name: Route by amount
    sequence: 1
    config:
      type: condition
      conditions:
        - sequence: 1
          field: total
          operator: ">"
          value: 10000
          next_step: cfo-review
        - sequence: 2
          is_default: true
          next_step: reserve
  - id: cfo-review
    name: CFO review
    sequence: 2
    timeout_secs: 3600
    config:
      type: approval
      approvers: [cfo]
  - id: reserve
    name: Reserve budget
    sequence: 3
    max_retries: 2
    terminal: true
    config:
      type: action
      handler: http
      params:
        url: "https://erp.example.com/reserve"
"#;

    fn replace(from: &str, to: &str) -> String {
        VALID.replacen(from, to, 1)
    }

    fn validation_message(yaml: &str) -> String {
        match parse_definition_yaml(yaml) {
            Err(DefinitionError::ValidationError(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_valid_definition() {
        let def = parse_definition_yaml(VALID).unwrap();
        assert_eq!(def.code, "purchase-order");
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.first_step().unwrap().id, "route");
    }

    #[test]
    fn test_rejects_empty_steps() {
        let yaml = "name: Empty\ncode: empty\nsteps: []\n";
        assert!(validation_message(yaml).contains("at least one step"));
    }

    #[test]
    fn test_rejects_duplicate_sequence() {
        let yaml = replace("sequence: 3\n    max_retries", "sequence: 2\n    max_retries");
        assert!(validation_message(&yaml).contains("duplicate sequence 2"));
    }

    #[test]
    fn test_rejects_unknown_branch_target() {
        let yaml = replace("next_step: cfo-review", "next_step: ceo-review");
        assert!(validation_message(&yaml).contains("unknown step 'ceo-review'"));
    }

    #[test]
    fn test_rejects_missing_default() {
        let yaml = replace("is_default: true", "is_default: false\n          field: total");
        assert!(validation_message(&yaml).contains("exactly one default"));
    }

    #[test]
    fn test_rejects_approval_without_timeout() {
        let yaml = replace("    timeout_secs: 3600\n", "");
        assert!(validation_message(&yaml).contains("positive timeout_secs"));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = parse_definition_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::ParseError(_)));
    }

    #[test]
    fn test_load_definition_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purchase-order.yaml");
        std::fs::write(&path, VALID).unwrap();

        let def = load_definition_file(&path).unwrap();
        assert_eq!(def.name, "Purchase order");

        let missing = load_definition_file(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(DefinitionError::IoError(_))));
    }

    #[test]
    fn test_serialize_then_parse_preserves_steps() {
        let def = parse_definition_yaml(VALID).unwrap();
        let yaml = serialize_definition_yaml(&def).unwrap();
        let again = parse_definition_yaml(&yaml).unwrap();
        assert_eq!(again.steps.len(), def.steps.len());
        assert!(again.step("reserve").unwrap().terminal);
    }
}
