//! Approval task records.
//!
//! An approval backs one attempt of an approval-type step. At most one
//! `Pending` approval exists per (instance, step) pair at any time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::ApprovalPriority;

/// Status of an approval task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    /// Handed to another approver; a new pending approval replaces it.
    Delegated,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
            ApprovalStatus::Delegated => write!(f, "delegated"),
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "delegated" => Ok(ApprovalStatus::Delegated),
            other => Err(format!("unknown approval status: '{other}'")),
        }
    }
}

/// A human-decision task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    /// The step attempt this approval belongs to.
    pub instance_step_id: Uuid,
    pub assigned_to: String,
    pub delegate: Option<String>,
    pub status: ApprovalStatus,
    pub priority: ApprovalPriority,
    pub due_at: DateTime<Utc>,
    /// Starts at 0, +1 per escalation.
    pub escalation_level: u32,
    pub decision: Option<Value>,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Pending and past its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now > self.due_at
    }
}

/// The verdict half of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// An approver's response to a pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Who decided. Recorded as-is; authorization happens upstream.
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Extra data; becomes the step output on approval.
    #[serde(default)]
    pub payload: Value,
}

impl Decision {
    pub fn approve(decided_by: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Approve,
            decided_by: decided_by.into(),
            comment: None,
            payload: Value::Null,
        }
    }

    pub fn reject(decided_by: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            decided_by: decided_by.into(),
            comment: Some(comment.into()),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Status the approval moves to.
    pub fn status(&self) -> ApprovalStatus {
        match self.verdict {
            Verdict::Approve => ApprovalStatus::Approved,
            Verdict::Reject => ApprovalStatus::Rejected,
        }
    }
}
