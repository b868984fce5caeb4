//! Workflow definition types for Stepwise.
//!
//! A `WorkflowDefinition` is the immutable-once-activated template an instance
//! executes: an ordered list of steps, each carrying a typed configuration for
//! its kind (action, condition, approval, notification). Condition steps own
//! their branch conditions.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned workflow template.
///
/// Definitions are looked up by `code` (unique per tenant). Each activation
/// of a code produces a new `version`; instances pin the definition id they
/// were started from so later versions never affect a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7, one per stored version.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Owning tenant. Opaque to the engine.
    #[serde(default)]
    pub tenant_id: String,
    /// Human-readable name.
    pub name: String,
    /// Stable code, unique per tenant across versions.
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Lifecycle status of this version.
    #[serde(default)]
    pub status: DefinitionStatus,
    /// What kind of trigger starts instances of this workflow.
    #[serde(default)]
    pub trigger_type: TriggerType,
    /// Entity type instances operate on (e.g. "purchase_order").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity_type: Option<String>,
    /// Monotonic per code. Assigned by the store on activation.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Steps, executed in ascending `sequence` order unless linked otherwise.
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a step by its id.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Steps sorted by sequence number.
    pub fn ordered_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<&StepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.sequence);
        steps
    }

    /// The entry step (lowest sequence number).
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.iter().min_by_key(|s| s.sequence)
    }

    /// The successor of `step` when no branch decides it.
    ///
    /// `terminal` steps have none. An explicit `next` link wins over sequence
    /// order; otherwise the step with the next-higher sequence number follows.
    pub fn static_successor(&self, step: &StepDefinition) -> Option<&StepDefinition> {
        if step.terminal {
            return None;
        }
        if let Some(next) = &step.next {
            return self.step(next);
        }
        self.steps
            .iter()
            .filter(|s| s.sequence > step.sequence)
            .min_by_key(|s| s.sequence)
    }

    /// Whether this version may start new instances.
    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }
}

/// Lifecycle status of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefinitionStatus::Draft => write!(f, "draft"),
            DefinitionStatus::Active => write!(f, "active"),
            DefinitionStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DefinitionStatus::Draft),
            "active" => Ok(DefinitionStatus::Active),
            "archived" => Ok(DefinitionStatus::Archived),
            other => Err(format!("unknown definition status: '{other}'")),
        }
    }
}

/// How instances of a workflow get started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    /// Started by a domain event on the target entity (e.g. "created").
    Event,
    Scheduled,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// One unit of work within a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Author-chosen id (e.g. "manager-review"). Unique within a definition.
    pub id: String,
    pub name: String,
    /// Position in the default execution order. Unique within a definition.
    pub sequence: u32,
    /// When false, a terminal failure is logged and the instance moves on.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Handler timeout for actions, approval deadline for approvals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retries allowed after the first failed attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Explicit successor overriding sequence order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// The instance completes after this step.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
    /// Typed configuration; its variant decides the step type.
    pub config: StepConfig,
}

fn default_required() -> bool {
    true
}

impl StepDefinition {
    /// The step type implied by the configuration variant.
    pub fn step_type(&self) -> StepType {
        match &self.config {
            StepConfig::Action(_) => StepType::Action,
            StepConfig::Condition(_) => StepType::Condition,
            StepConfig::Approval(_) => StepType::Approval,
            StepConfig::Notification(_) => StepType::Notification,
        }
    }

    /// Configured timeout, or `default` when the step has none.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }
}

/// The kind of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Condition,
    Approval,
    Notification,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Action => write!(f, "action"),
            StepType::Condition => write!(f, "condition"),
            StepType::Approval => write!(f, "approval"),
            StepType::Notification => write!(f, "notification"),
        }
    }
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type` to match YAML structure:
/// ```yaml
/// config:
///   type: action
///   handler: http
///   params:
///     url: "https://erp.example.com/orders/reserve"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Action(ActionConfig),
    Condition(ConditionConfig),
    Approval(ApprovalConfig),
    Notification(NotificationConfig),
}

/// Invoke a registered action handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Name the handler is registered under.
    pub handler: String,
    /// Opaque parameters passed to the handler.
    #[serde(default)]
    pub params: Value,
}

/// Branch on the instance context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub conditions: Vec<Condition>,
}

impl ConditionConfig {
    /// The fallback condition, if one is declared.
    pub fn default_condition(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .filter(|c| c.is_default)
            .min_by_key(|c| c.sequence)
    }
}

/// Human approval task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Explicit approver identities, in escalation order.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Role whose members are appended to the escalation chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub priority: ApprovalPriority,
    /// Deadline extension applied on each escalation. Defaults to the step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_timeout_secs: Option<u64>,
    /// Approver used once the escalation chain is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_approver: Option<String>,
    /// Shown to the approver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Fire-and-forget notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Delivery channel name (e.g. "email", "slack").
    pub channel: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Message body; `{{ field }}` placeholders resolve against the context.
    pub template: String,
}

/// Priority of an approval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for ApprovalPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalPriority::Low => write!(f, "low"),
            ApprovalPriority::Normal => write!(f, "normal"),
            ApprovalPriority::High => write!(f, "high"),
            ApprovalPriority::Urgent => write!(f, "urgent"),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// One outgoing branch of a condition step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Evaluation order, ascending.
    pub sequence: u32,
    /// Context field reference; dots descend into nested objects.
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    /// Comparison value.
    #[serde(default)]
    pub value: Value,
    /// Target step; `None` ends the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
}

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[default]
    #[serde(rename = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ConditionOperator::Eq => "=",
            ConditionOperator::Ne => "!=",
            ConditionOperator::Gt => ">",
            ConditionOperator::Gte => ">=",
            ConditionOperator::Lt => "<",
            ConditionOperator::Lte => "<=",
            ConditionOperator::Contains => "contains",
            ConditionOperator::In => "in",
        };
        f.write_str(symbol)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(id: &str, sequence: u32) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_uppercase(),
            sequence,
            required: true,
            timeout_secs: None,
            max_retries: 0,
            next: None,
            terminal: false,
            config: StepConfig::Action(ActionConfig {
                handler: "echo".to_string(),
                params: json!({}),
            }),
        }
    }

    fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            name: "Order approval".to_string(),
            code: "order-approval".to_string(),
            description: None,
            status: DefinitionStatus::Active,
            trigger_type: TriggerType::Manual,
            target_entity_type: Some("order".to_string()),
            version: 1,
            steps,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn static_successor_follows_sequence_not_vec_order() {
        let def = definition(vec![action("c", 30), action("a", 10), action("b", 20)]);

        assert_eq!(def.first_step().unwrap().id, "a");
        let a = def.step("a").unwrap();
        assert_eq!(def.static_successor(a).unwrap().id, "b");
        let c = def.step("c").unwrap();
        assert!(def.static_successor(c).is_none());
    }

    #[test]
    fn explicit_next_and_terminal_override_sequence() {
        let mut a = action("a", 10);
        a.next = Some("c".to_string());
        let mut b = action("b", 20);
        b.terminal = true;
        let def = definition(vec![a, b, action("c", 30)]);

        assert_eq!(def.static_successor(def.step("a").unwrap()).unwrap().id, "c");
        assert!(def.static_successor(def.step("b").unwrap()).is_none());
    }

    #[test]
    fn step_type_follows_config_variant() {
        let mut step = action("a", 1);
        assert_eq!(step.step_type(), StepType::Action);
        step.config = StepConfig::Approval(ApprovalConfig::default());
        assert_eq!(step.step_type(), StepType::Approval);
        assert_eq!(step.step_type().to_string(), "approval");
    }

    #[test]
    fn yaml_definition_applies_defaults() {
        let yaml = r#"
name: Expense claim
code: expense-claim
steps:
  - id: check-amount
    name: Check amount
    sequence: 1
    config:
      type: condition
      conditions:
        - sequence: 1
          field: amount
          operator: ">="
          value: 1000
          next_step: manager-review
        - sequence: 2
          is_default: true
          next_step: auto-approve
  - id: manager-review
    name: Manager review
    sequence: 2
    timeout_secs: 3600
    config:
      type: approval
      role: managers
      priority: high
  - id: auto-approve
    name: Auto approve
    sequence: 3
    required: false
    config:
      type: action
      handler: echo
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(def.status, DefinitionStatus::Draft);
        assert_eq!(def.steps.len(), 3);
        assert!(def.steps[0].required);
        assert!(!def.steps[2].required);

        match &def.steps[0].config {
            StepConfig::Condition(cfg) => {
                assert_eq!(cfg.conditions[0].operator, ConditionOperator::Gte);
                assert_eq!(cfg.conditions[0].value, json!(1000));
                let default = cfg.default_condition().unwrap();
                assert_eq!(default.next_step.as_deref(), Some("auto-approve"));
            }
            other => panic!("expected condition config, got {other:?}"),
        }
        match &def.steps[1].config {
            StepConfig::Approval(cfg) => {
                assert_eq!(cfg.role.as_deref(), Some("managers"));
                assert_eq!(cfg.priority, ApprovalPriority::High);
            }
            other => panic!("expected approval config, got {other:?}"),
        }
    }

    #[test]
    fn operator_accepts_symbols_and_aliases() {
        let ops: Vec<ConditionOperator> =
            serde_json::from_value(json!(["=", "ne", ">", "lte", "contains", "in"])).unwrap();
        assert_eq!(
            ops,
            vec![
                ConditionOperator::Eq,
                ConditionOperator::Ne,
                ConditionOperator::Gt,
                ConditionOperator::Lte,
                ConditionOperator::Contains,
                ConditionOperator::In,
            ]
        );
        assert_eq!(serde_json::to_value(ConditionOperator::Gte).unwrap(), json!(">="));
    }
}
