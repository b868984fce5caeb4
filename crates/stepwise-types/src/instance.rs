//! Workflow instance and instance-step records.
//!
//! An instance is one execution of a definition against a specific entity.
//! Every attempt to run a step is an `InstanceStep`; retries append new
//! records instead of overwriting old ones, so the full history survives.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::workflow::StepType;

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
///
/// `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(InstanceStatus::Running),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("unknown instance status: '{other}'")),
        }
    }
}

/// The domain entity an instance operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// One running (or finished) execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    /// Definition version pinned at start.
    pub definition_id: Uuid,
    pub definition_code: String,
    pub definition_version: u32,
    pub tenant_id: String,
    pub status: InstanceStatus,
    pub entity: EntityRef,
    /// Key/value bag accumulated from step outputs.
    pub context: Map<String, Value>,
    /// Step to execute on the next advance. `None` once terminal.
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl WorkflowInstance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// Move to `Completed` and clear the current step.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Completed;
        self.current_step = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Move to `Failed`, keeping `current_step` pointing at the failing step.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = InstanceStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Instance Step
// ---------------------------------------------------------------------------

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status: '{other}'")),
        }
    }
}

/// One attempt at executing a step within an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStep {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Snapshot of the instance context when the attempt started.
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When a `Running` action attempt is considered timed out.
    pub deadline_at: Option<DateTime<Utc>>,
    /// Earliest time a `Pending` retry attempt may run.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl InstanceStep {
    /// A fresh pending attempt.
    pub fn pending(
        instance_id: Uuid,
        step_id: impl Into<String>,
        step_type: StepType,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.into(),
            step_type,
            status: StepStatus::Pending,
            attempt,
            input: Value::Null,
            output: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            deadline_at: None,
            scheduled_at: None,
        }
    }

    /// Whether a pending attempt may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn mark_completed(&mut self, output: Value, now: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn instance() -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_code: "order-approval".to_string(),
            definition_version: 2,
            tenant_id: "acme".to_string(),
            status: InstanceStatus::Running,
            entity: EntityRef {
                entity_type: "order".to_string(),
                entity_id: "PO-1001".to_string(),
            },
            context: Map::new(),
            current_step: Some("review".to_string()),
            started_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
            error: None,
        }
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_parses_its_display_form() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn completing_clears_current_step() {
        let mut inst = instance();
        let now = Utc::now();
        inst.mark_completed(now);
        assert_eq!(inst.status, InstanceStatus::Completed);
        assert!(inst.current_step.is_none());
        assert_eq!(inst.completed_at, Some(now));
    }

    #[test]
    fn failing_keeps_step_and_records_error() {
        let mut inst = instance();
        inst.mark_failed("step 'review' rejected", Utc::now());
        assert_eq!(inst.status, InstanceStatus::Failed);
        assert_eq!(inst.current_step.as_deref(), Some("review"));
        assert_eq!(inst.error.as_deref(), Some("step 'review' rejected"));
    }

    #[test]
    fn pending_attempt_due_only_after_schedule() {
        let now = Utc::now();
        let mut step = InstanceStep::pending(Uuid::now_v7(), "charge", StepType::Action, 2, now);
        assert!(step.is_due(now));

        step.scheduled_at = Some(now + Duration::seconds(30));
        assert!(!step.is_due(now));
        assert!(step.is_due(now + Duration::seconds(30)));
    }
}
