//! Lifecycle events published by the workflow engine.
//!
//! `WorkflowEvent` is emitted once per committed transition, after the
//! instance lock is released. Delivery is at-least-once; consumers
//! deduplicate on [`WorkflowEvent::dedup_key`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Events emitted by the orchestrator and approval manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A new instance was created against an active definition.
    InstanceStarted {
        instance_id: Uuid,
        definition_code: String,
        definition_version: u32,
    },

    /// A step attempt completed.
    StepCompleted {
        instance_id: Uuid,
        step_id: String,
        output: Value,
    },

    /// A step failed terminally (retries exhausted or non-retryable).
    StepFailed {
        instance_id: Uuid,
        step_id: String,
        error: String,
    },

    /// The instance reached the end of its definition.
    InstanceCompleted { instance_id: Uuid },

    /// The instance failed; `error` is carried from the failing step.
    InstanceFailed { instance_id: Uuid, error: String },

    InstanceCancelled { instance_id: Uuid },

    /// A pending approval task was created.
    ApprovalRequested {
        approval_id: Uuid,
        instance_id: Uuid,
        step_id: String,
        assigned_to: String,
    },

    /// A pending approval was approved or rejected.
    ApprovalDecided {
        approval_id: Uuid,
        instance_id: Uuid,
        step_id: String,
        approved: bool,
        decided_by: String,
    },

    /// A pending approval passed its deadline and was reassigned.
    ApprovalEscalated {
        approval_id: Uuid,
        instance_id: Uuid,
        step_id: String,
        new_level: u32,
        new_approver: String,
    },

    /// A pending approval was handed to another approver.
    ApprovalDelegated {
        approval_id: Uuid,
        new_approval_id: Uuid,
        instance_id: Uuid,
        step_id: String,
        delegate: String,
    },
}

impl WorkflowEvent {
    /// Dotted event name, e.g. `step.completed`.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::InstanceStarted { .. } => "instance.started",
            WorkflowEvent::StepCompleted { .. } => "step.completed",
            WorkflowEvent::StepFailed { .. } => "step.failed",
            WorkflowEvent::InstanceCompleted { .. } => "instance.completed",
            WorkflowEvent::InstanceFailed { .. } => "instance.failed",
            WorkflowEvent::InstanceCancelled { .. } => "instance.cancelled",
            WorkflowEvent::ApprovalRequested { .. } => "approval.requested",
            WorkflowEvent::ApprovalDecided { .. } => "approval.decided",
            WorkflowEvent::ApprovalEscalated { .. } => "approval.escalated",
            WorkflowEvent::ApprovalDelegated { .. } => "approval.delegated",
        }
    }

    /// The instance this event belongs to.
    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkflowEvent::InstanceStarted { instance_id, .. }
            | WorkflowEvent::StepCompleted { instance_id, .. }
            | WorkflowEvent::StepFailed { instance_id, .. }
            | WorkflowEvent::InstanceCompleted { instance_id }
            | WorkflowEvent::InstanceFailed { instance_id, .. }
            | WorkflowEvent::InstanceCancelled { instance_id }
            | WorkflowEvent::ApprovalRequested { instance_id, .. }
            | WorkflowEvent::ApprovalDecided { instance_id, .. }
            | WorkflowEvent::ApprovalEscalated { instance_id, .. }
            | WorkflowEvent::ApprovalDelegated { instance_id, .. } => *instance_id,
        }
    }

    /// Step id for step- and approval-scoped events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::ApprovalRequested { step_id, .. }
            | WorkflowEvent::ApprovalDecided { step_id, .. }
            | WorkflowEvent::ApprovalEscalated { step_id, .. }
            | WorkflowEvent::ApprovalDelegated { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Key consumers deduplicate redelivered events on.
    ///
    /// Escalations are distinguished by level since one step may escalate
    /// more than once.
    pub fn dedup_key(&self) -> String {
        let step = self.step_id().unwrap_or("-");
        match self {
            WorkflowEvent::ApprovalEscalated { new_level, .. } => {
                format!("{}/{}/{}#{}", self.instance_id(), step, self.event_type(), new_level)
            }
            _ => format!("{}/{}/{}", self.instance_id(), step, self.event_type()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_snake_case_tag() {
        let event = WorkflowEvent::StepCompleted {
            instance_id: Uuid::nil(),
            step_id: "reserve".to_string(),
            output: json!({"reserved": true}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step_completed");
        assert_eq!(value["step_id"], "reserve");
        assert_eq!(event.event_type(), "step.completed");
    }

    #[test]
    fn dedup_key_combines_instance_step_and_type() {
        let id = Uuid::now_v7();
        let completed = WorkflowEvent::InstanceCompleted { instance_id: id };
        assert_eq!(completed.dedup_key(), format!("{id}/-/instance.completed"));

        let first = WorkflowEvent::ApprovalEscalated {
            approval_id: Uuid::now_v7(),
            instance_id: id,
            step_id: "review".to_string(),
            new_level: 1,
            new_approver: "carol".to_string(),
        };
        let second = WorkflowEvent::ApprovalEscalated {
            approval_id: Uuid::now_v7(),
            instance_id: id,
            step_id: "review".to_string(),
            new_level: 2,
            new_approver: "workflow-admin".to_string(),
        };
        assert_ne!(first.dedup_key(), second.dedup_key());
        assert_eq!(first.step_id(), Some("review"));
    }
}
