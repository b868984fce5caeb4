//! Approval task lifecycle: creation, decisions, escalation, delegation.
//!
//! `ApprovalManager` owns every write to approval records. Callers that mutate
//! approvals of a running instance (the orchestrator and the sweeper) hold the
//! instance lock while doing so; the manager itself does not lock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use stepwise_types::approval::{Approval, ApprovalStatus, Decision};
use stepwise_types::config::ApprovalDefaults;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::InstanceStep;
use stepwise_types::workflow::{ApprovalConfig, StepDefinition};
use thiserror::Error;
use uuid::Uuid;

use crate::repository::approval::ApprovalRepository;

use super::actor::{ActorResolver, ResolverError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0} not found")]
    NotFound(Uuid),

    /// The approval is no longer pending; nothing was changed.
    #[error("approval {approval_id} already {status}")]
    AlreadyDecided {
        approval_id: Uuid,
        status: ApprovalStatus,
    },

    #[error("cannot delegate approval {0} to its current assignee")]
    SelfDelegation(Uuid),

    #[error("actor resolution failed: {0}")]
    Resolver(#[from] ResolverError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// ApprovalState
// ---------------------------------------------------------------------------

/// Where an approval-type step attempt stands.
#[derive(Debug, Clone)]
pub enum ApprovalState {
    /// A pending task exists. `created` is true if this call created it.
    Waiting { approval: Approval, created: bool },
    Approved(Approval),
    Rejected(Approval),
}

// ---------------------------------------------------------------------------
// ApprovalManager
// ---------------------------------------------------------------------------

pub struct ApprovalManager<A: ApprovalRepository> {
    repo: A,
    resolver: Arc<dyn ActorResolver>,
    defaults: ApprovalDefaults,
}

impl<A: ApprovalRepository> ApprovalManager<A> {
    pub fn new(repo: A, resolver: Arc<dyn ActorResolver>, defaults: ApprovalDefaults) -> Self {
        Self {
            repo,
            resolver,
            defaults,
        }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &A {
        &self.repo
    }

    /// Resolve the state of an approval step attempt, creating its task on
    /// first contact.
    ///
    /// Idempotent: repeated calls for a waiting attempt return the existing
    /// pending task without writing.
    pub async fn resolve_or_request(
        &self,
        attempt: &InstanceStep,
        step: &StepDefinition,
        config: &ApprovalConfig,
        context: &Map<String, Value>,
    ) -> Result<ApprovalState, ApprovalError> {
        match self.repo.latest_for_attempt(&attempt.id).await? {
            Some(approval) => match approval.status {
                ApprovalStatus::Pending => Ok(ApprovalState::Waiting {
                    approval,
                    created: false,
                }),
                ApprovalStatus::Approved => Ok(ApprovalState::Approved(approval)),
                ApprovalStatus::Rejected => Ok(ApprovalState::Rejected(approval)),
                ApprovalStatus::Delegated => {
                    // Delegation was interrupted before the replacement task
                    // was written. Finish it.
                    let delegate = approval
                        .delegate
                        .clone()
                        .unwrap_or_else(|| approval.assigned_to.clone());
                    let replacement = self.replacement_for(&approval, delegate);
                    self.repo.create_approval(&replacement).await?;
                    Ok(ApprovalState::Waiting {
                        approval: replacement,
                        created: true,
                    })
                }
            },
            None => {
                let candidates = self.candidates(step, context).await?;
                let approval = self.create_task(attempt, step, config, &candidates).await?;
                Ok(ApprovalState::Waiting {
                    approval,
                    created: true,
                })
            }
        }
    }

    /// Create the pending approval for a step attempt.
    ///
    /// The first candidate is assigned; with no candidates the fallback
    /// approver is. If a pending approval already exists for the
    /// (instance, step) pair it is returned unchanged.
    pub async fn create_task(
        &self,
        attempt: &InstanceStep,
        step: &StepDefinition,
        config: &ApprovalConfig,
        candidates: &[String],
    ) -> Result<Approval, ApprovalError> {
        if let Some(existing) = self
            .repo
            .pending_for_step(&attempt.instance_id, &attempt.step_id)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let assigned_to = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| self.fallback_approver(config));

        let approval = Approval {
            id: Uuid::now_v7(),
            instance_id: attempt.instance_id,
            step_id: attempt.step_id.clone(),
            instance_step_id: attempt.id,
            assigned_to,
            delegate: None,
            status: ApprovalStatus::Pending,
            priority: config.priority,
            due_at: now + self.approval_timeout(step),
            escalation_level: 0,
            decision: None,
            decided_by: None,
            comment: None,
            responded_at: None,
            created_at: now,
        };
        self.repo.create_approval(&approval).await?;

        tracing::info!(
            approval_id = %approval.id,
            instance_id = %approval.instance_id,
            step_id = approval.step_id.as_str(),
            assigned_to = approval.assigned_to.as_str(),
            due_at = %approval.due_at,
            "approval requested"
        );
        Ok(approval)
    }

    /// Record an approve/reject decision.
    ///
    /// Only a pending approval can be decided; anything else fails with
    /// `AlreadyDecided` and changes nothing.
    pub async fn record_decision(
        &self,
        approval_id: &Uuid,
        decision: &Decision,
    ) -> Result<Approval, ApprovalError> {
        let mut approval = self.load(approval_id).await?;
        if !approval.is_pending() {
            return Err(ApprovalError::AlreadyDecided {
                approval_id: approval.id,
                status: approval.status,
            });
        }

        approval.status = decision.status();
        approval.decision = Some(decision.payload.clone());
        approval.decided_by = Some(decision.decided_by.clone());
        approval.comment = decision.comment.clone();
        approval.responded_at = Some(Utc::now());
        self.repo.save_approval(&approval).await?;

        tracing::info!(
            approval_id = %approval.id,
            instance_id = %approval.instance_id,
            status = %approval.status,
            decided_by = decision.decided_by.as_str(),
            "approval decided"
        );
        Ok(approval)
    }

    /// Escalate an overdue pending approval.
    ///
    /// Bumps `escalation_level`, reassigns to the candidate at the new level
    /// (or the fallback approver once the chain is exhausted) and extends
    /// `due_at`. Status stays `Pending`. Returns `None` when the approval is
    /// not pending or not yet overdue at `now`.
    pub async fn escalate(
        &self,
        approval_id: &Uuid,
        step: &StepDefinition,
        config: &ApprovalConfig,
        context: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Option<Approval>, ApprovalError> {
        let mut approval = self.load(approval_id).await?;
        if !approval.is_overdue(now) {
            return Ok(None);
        }

        let candidates = self.candidates(step, context).await?;
        let previous = approval.assigned_to.clone();
        approval.escalation_level += 1;
        approval.assigned_to = candidates
            .get(approval.escalation_level as usize)
            .cloned()
            .unwrap_or_else(|| self.fallback_approver(config));
        approval.due_at = now + self.escalation_timeout(step, config);
        self.repo.save_approval(&approval).await?;

        tracing::warn!(
            approval_id = %approval.id,
            instance_id = %approval.instance_id,
            level = approval.escalation_level,
            from = previous.as_str(),
            to = approval.assigned_to.as_str(),
            "approval escalated"
        );
        Ok(Some(approval))
    }

    /// Hand a pending approval to another approver.
    ///
    /// The original becomes `Delegated`; a new pending approval for the
    /// delegate inherits priority, deadline and escalation level. Returns
    /// `(original, replacement)`.
    pub async fn delegate(
        &self,
        approval_id: &Uuid,
        delegate_to: &str,
    ) -> Result<(Approval, Approval), ApprovalError> {
        let mut original = self.load(approval_id).await?;
        if !original.is_pending() {
            return Err(ApprovalError::AlreadyDecided {
                approval_id: original.id,
                status: original.status,
            });
        }
        if original.assigned_to == delegate_to {
            return Err(ApprovalError::SelfDelegation(original.id));
        }

        original.status = ApprovalStatus::Delegated;
        original.delegate = Some(delegate_to.to_string());
        original.responded_at = Some(Utc::now());
        self.repo.save_approval(&original).await?;

        let replacement = self.replacement_for(&original, delegate_to.to_string());
        self.repo.create_approval(&replacement).await?;

        tracing::info!(
            approval_id = %original.id,
            new_approval_id = %replacement.id,
            delegate = delegate_to,
            "approval delegated"
        );
        Ok((original, replacement))
    }

    /// Close every pending approval of an instance that stopped running.
    ///
    /// Each becomes `Rejected` with `decided_by` and `reason` recorded, so it
    /// leaves the pending and overdue lists. Returns the closed approvals.
    pub async fn withdraw_pending(
        &self,
        instance_id: &Uuid,
        decided_by: &str,
        reason: &str,
    ) -> Result<Vec<Approval>, ApprovalError> {
        let now = Utc::now();
        let mut closed = Vec::new();
        for mut approval in self.repo.list_for_instance(instance_id).await? {
            if !approval.is_pending() {
                continue;
            }
            approval.status = ApprovalStatus::Rejected;
            approval.decided_by = Some(decided_by.to_string());
            approval.comment = Some(reason.to_string());
            approval.responded_at = Some(now);
            self.repo.save_approval(&approval).await?;

            tracing::info!(
                approval_id = %approval.id,
                instance_id = %instance_id,
                reason,
                "pending approval withdrawn"
            );
            closed.push(approval);
        }
        Ok(closed)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load(&self, approval_id: &Uuid) -> Result<Approval, ApprovalError> {
        self.repo
            .get_approval(approval_id)
            .await?
            .ok_or(ApprovalError::NotFound(*approval_id))
    }

    /// Ordered, de-duplicated approver candidates for a step.
    async fn candidates(
        &self,
        step: &StepDefinition,
        context: &Map<String, Value>,
    ) -> Result<Vec<String>, ApprovalError> {
        let mut resolved = self.resolver.resolve_approvers(step, context).await?;
        let mut seen = std::collections::HashSet::new();
        resolved.retain(|who| seen.insert(who.clone()));
        Ok(resolved)
    }

    fn replacement_for(&self, original: &Approval, assigned_to: String) -> Approval {
        Approval {
            id: Uuid::now_v7(),
            assigned_to,
            delegate: None,
            status: ApprovalStatus::Pending,
            decision: None,
            decided_by: None,
            comment: None,
            responded_at: None,
            created_at: Utc::now(),
            ..original.clone()
        }
    }

    fn fallback_approver(&self, config: &ApprovalConfig) -> String {
        config
            .fallback_approver
            .clone()
            .unwrap_or_else(|| self.defaults.fallback_approver.clone())
    }

    fn approval_timeout(&self, step: &StepDefinition) -> Duration {
        deadline_secs(step.timeout_secs.unwrap_or(self.defaults.default_timeout_secs))
    }

    fn escalation_timeout(&self, step: &StepDefinition, config: &ApprovalConfig) -> Duration {
        match config.escalation_timeout_secs {
            Some(secs) => deadline_secs(secs),
            None => self.approval_timeout(step),
        }
    }
}

/// Deadlines are capped at ten years.
fn deadline_secs(secs: u64) -> Duration {
    const MAX_DEADLINE_SECS: u64 = 10 * 365 * 24 * 60 * 60;
    Duration::seconds(secs.min(MAX_DEADLINE_SECS) as i64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
