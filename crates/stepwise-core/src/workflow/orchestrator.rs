//! Instance orchestrator: the workflow instance state machine.
//!
//! Every mutation of an instance happens inside one lease on that instance:
//!
//! 1. Acquire the lease (fail fast with `LockContention`)
//! 2. Load the instance, its pinned definition and the current step
//! 3. Execute one attempt of the current step via [`StepExecutor`]
//! 4. Apply the outcome: merge output, pick the successor, or fail/complete
//! 5. Release the lease, then publish the collected events
//!
//! One `advance()` is one step transition. Approval waits never hold a lease:
//! the instance resumes on `record_decision()` or when the sweeper escalates.
//!
//! Before an action handler runs, the lease is renewed to cover the handler
//! timeout. Before the outcome is applied, the lease is renewed again; a
//! holder whose lease was taken over discards its result with `LeaseLost`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use stepwise_types::approval::{Approval, ApprovalStatus, Decision};
use stepwise_types::config::EngineConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::instance::{
    EntityRef, InstanceStatus, InstanceStep, StepStatus, WorkflowInstance,
};
use stepwise_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventSink;
use crate::repository::approval::ApprovalRepository;
use crate::repository::definition::DefinitionStore;
use crate::repository::instance::{InstanceRepository, Lease};

use super::actor::ActorResolver;
use super::approval::{ApprovalError, ApprovalManager};
use super::context::merge_output;
use super::handler::ActionHandlerRegistry;
use super::notify::NotificationDispatcher;
use super::retry::RetryPolicy;
use super::step_executor::{
    CANCELLED_MESSAGE, ExecutorError, StepError, StepExecutor, StepOutcome,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another holder owns the instance lease. Transient; retry later.
    #[error("instance {0} is locked by another worker")]
    LockContention(Uuid),

    /// The lease lapsed mid-transition and another holder took it over.
    /// Nothing was committed.
    #[error("lease on instance {0} was lost before the step result was applied")]
    LeaseLost(Uuid),

    /// The operation is not valid in the instance's current status.
    #[error("instance {instance_id} is {status}")]
    InvalidTransition {
        instance_id: Uuid,
        status: InstanceStatus,
    },

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("no active definition '{0}'")]
    DefinitionNotFound(String),

    #[error("definition '{0}' has no steps")]
    EmptyDefinition(String),

    #[error("approval {0} not found")]
    ApprovalNotFound(Uuid),

    #[error("approval {approval_id} already {status}")]
    AlreadyDecided {
        approval_id: Uuid,
        status: ApprovalStatus,
    },

    #[error("approval error: {0}")]
    Approval(ApprovalError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Unexpected failures that must not leave an instance mid-transition.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Approval(_)
                | OrchestratorError::Repository(_)
                | OrchestratorError::Internal(_)
        )
    }
}

impl From<ApprovalError> for OrchestratorError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(id) => OrchestratorError::ApprovalNotFound(id),
            ApprovalError::AlreadyDecided {
                approval_id,
                status,
            } => OrchestratorError::AlreadyDecided {
                approval_id,
                status,
            },
            ApprovalError::Repository(e) => OrchestratorError::Repository(e),
            other => OrchestratorError::Approval(other),
        }
    }
}

impl From<ExecutorError> for OrchestratorError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Repository(e) => OrchestratorError::Repository(e),
            ExecutorError::Approval(e) => e.into(),
        }
    }
}

/// Slack added on top of a handler timeout when renewing the lease for it.
pub const LEASE_MARGIN: Duration = Duration::from_secs(30);

/// Actor recorded on approvals closed because their instance stopped running.
pub const SYSTEM_ACTOR: &str = "system";

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of one `advance()` call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The instance is not running; nothing was written.
    NotRunning(InstanceStatus),
    /// The current step finished and the instance moved to `next_step`.
    Advanced { next_step: String },
    Completed,
    Failed { error: String },
    /// An approval task is pending on the current step.
    Waiting { approval_id: Uuid },
    /// The current step failed and will be retried after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// The next attempt of the current step is not due yet.
    NotDue { scheduled_at: DateTime<Utc> },
    Cancelled,
}

/// Result of a `cancel()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The instance is now `Cancelled`.
    Cancelled,
    /// An in-process `advance()` holds the lease; it will cancel the
    /// instance at its next transition boundary.
    CancelRequested,
}

// ---------------------------------------------------------------------------
// InstanceOrchestrator
// ---------------------------------------------------------------------------

/// Owns the instance state machine.
pub struct InstanceOrchestrator<D, I, A>
where
    D: DefinitionStore,
    I: InstanceRepository,
    A: ApprovalRepository,
{
    definitions: D,
    instances: I,
    approvals: Arc<ApprovalManager<A>>,
    executor: StepExecutor<I, A>,
    events: Arc<dyn EventSink>,
    lease_ttl: Duration,
    /// Cancellation tokens of `advance()` calls running in this process.
    in_flight: DashMap<Uuid, CancellationToken>,
}

impl<D, I, A> InstanceOrchestrator<D, I, A>
where
    D: DefinitionStore,
    I: InstanceRepository + Clone,
    A: ApprovalRepository,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definitions: D,
        instances: I,
        approvals: A,
        resolver: Arc<dyn ActorResolver>,
        handlers: ActionHandlerRegistry,
        notifier: Arc<dyn NotificationDispatcher>,
        events: Arc<dyn EventSink>,
        config: &EngineConfig,
    ) -> Self {
        let approvals = Arc::new(ApprovalManager::new(
            approvals,
            resolver,
            config.approvals.clone(),
        ));
        let executor = StepExecutor::new(
            instances.clone(),
            Arc::clone(&approvals),
            handlers,
            notifier,
            RetryPolicy::from_config(&config.retry),
            config.default_step_timeout(),
        );
        Self {
            definitions,
            instances,
            approvals,
            executor,
            events,
            lease_ttl: config.lock_lease(),
            in_flight: DashMap::new(),
        }
    }
}

impl<D, I, A> InstanceOrchestrator<D, I, A>
where
    D: DefinitionStore,
    I: InstanceRepository,
    A: ApprovalRepository,
{
    pub fn definitions(&self) -> &D {
        &self.definitions
    }

    pub fn instances(&self) -> &I {
        &self.instances
    }

    pub fn approvals(&self) -> &ApprovalManager<A> {
        &self.approvals
    }

    pub fn handlers(&self) -> &ActionHandlerRegistry {
        self.executor.handlers()
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create a running instance of the active version of `code`, positioned
    /// at its first step. The instance pins that definition version.
    pub async fn start_instance(
        &self,
        code: &str,
        tenant: &str,
        entity: EntityRef,
        context: Map<String, Value>,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let definition = self
            .definitions
            .get_active_definition(code, tenant)
            .await?
            .ok_or_else(|| OrchestratorError::DefinitionNotFound(code.to_string()))?;
        let first = definition
            .first_step()
            .ok_or_else(|| OrchestratorError::EmptyDefinition(code.to_string()))?;

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            definition_code: definition.code.clone(),
            definition_version: definition.version,
            tenant_id: tenant.to_string(),
            status: InstanceStatus::Running,
            entity,
            context,
            current_step: Some(first.id.clone()),
            started_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
            error: None,
        };
        self.instances.create_instance(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition = definition.code.as_str(),
            version = definition.version,
            first_step = first.id.as_str(),
            "instance started"
        );
        self.events.publish(WorkflowEvent::InstanceStarted {
            instance_id: instance.id,
            definition_code: definition.code.clone(),
            definition_version: definition.version,
        });
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    /// Perform one step transition on an instance.
    ///
    /// Advancing a terminal instance is a no-op. Internal errors are
    /// converted into an instance `Failed` transition.
    pub async fn advance(&self, instance_id: &Uuid) -> Result<AdvanceOutcome, OrchestratorError> {
        let mut lease = self.acquire(instance_id).await?;
        let token = self.register(instance_id);
        let mut events = Vec::new();

        let result = self.drive(&mut lease, &token, &mut events).await;
        let result = self.settle(instance_id, result, &mut events).await;

        self.in_flight.remove(instance_id);
        self.release(&lease).await;
        self.publish(events);
        result
    }

    async fn drive(
        &self,
        lease: &mut Lease,
        token: &CancellationToken,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let instance_id = lease.instance_id;
        let mut instance = self.load_instance(&instance_id).await?;
        if !instance.is_running() {
            return Ok(AdvanceOutcome::NotRunning(instance.status));
        }

        let definition = self.pinned_definition(&instance).await?;
        let step = current_step(&definition, &instance)?;
        let now = Utc::now();

        let latest = self.instances.latest_step(&instance_id, &step.id).await?;
        let mut attempt = match latest {
            // Finished after the instance last moved: the previous holder
            // stopped between recording the attempt and applying it.
            Some(attempt)
                if attempt.status.is_finished()
                    && attempt.completed_at.is_some_and(|at| at > instance.updated_at) =>
            {
                attempt
            }
            Some(attempt) if !attempt.status.is_finished() => attempt,
            _ => InstanceStep::pending(instance.id, &step.id, step.step_type(), 1, now),
        };

        let outcome = match self.executor.replay(step, &attempt) {
            Some(outcome) => {
                tracing::debug!(
                    instance_id = %instance.id,
                    step_id = step.id.as_str(),
                    attempt = attempt.attempt,
                    "replaying recorded step result"
                );
                outcome
            }
            None => {
                if attempt.status == StepStatus::Pending && !attempt.is_due(now) {
                    return Ok(AdvanceOutcome::NotDue {
                        scheduled_at: attempt.scheduled_at.unwrap_or(now),
                    });
                }
                if matches!(step.config, StepConfig::Action(_)) {
                    let hold = self.executor.timeout_for(step).saturating_add(LEASE_MARGIN);
                    if hold > self.lease_ttl {
                        *lease = self.renew(lease, hold).await?;
                    }
                }
                self.executor
                    .execute(&instance, step, &mut attempt, token)
                    .await?
            }
        };

        // Cancellation is observed at the transition boundary.
        let outcome = if token.is_cancelled() {
            StepOutcome::Cancelled
        } else {
            outcome
        };

        *lease = self.renew(lease, self.lease_ttl).await?;
        self.apply(&mut instance, &definition, step, &mut attempt, outcome, events)
            .await
    }

    async fn apply(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &StepDefinition,
        attempt: &mut InstanceStep,
        outcome: StepOutcome,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        match outcome {
            StepOutcome::Completed { output } => {
                merge_output(&mut instance.context, &step.id, &output);
                events.push(WorkflowEvent::StepCompleted {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    output,
                });
                match static_next(definition, step) {
                    Ok(next) => self.transition(instance, next, events).await,
                    Err(err) => {
                        self.fail_instance(instance, step, &err.to_string(), events)
                            .await
                    }
                }
            }
            StepOutcome::Branched { next_step, output } => {
                events.push(WorkflowEvent::StepCompleted {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    output,
                });
                if let Some(target) = &next_step {
                    if definition.step(target).is_none() {
                        let error = StepError::UnknownBranchTarget(target.clone()).to_string();
                        return self.fail_instance(instance, step, &error, events).await;
                    }
                }
                self.transition(instance, next_step, events).await
            }
            StepOutcome::Waiting { approval, created } => {
                if created {
                    events.push(WorkflowEvent::ApprovalRequested {
                        approval_id: approval.id,
                        instance_id: instance.id,
                        step_id: step.id.clone(),
                        assigned_to: approval.assigned_to.clone(),
                    });
                }
                Ok(AdvanceOutcome::Waiting {
                    approval_id: approval.id,
                })
            }
            StepOutcome::RetryScheduled { attempt, delay, .. } => {
                Ok(AdvanceOutcome::RetryScheduled { attempt, delay })
            }
            StepOutcome::Failed { error } => {
                events.push(WorkflowEvent::StepFailed {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    error: error.clone(),
                });
                if step.required {
                    return self.fail_instance(instance, step, &error, events).await;
                }
                match default_successor(definition, step) {
                    Some(next) => {
                        tracing::warn!(
                            instance_id = %instance.id,
                            step_id = step.id.as_str(),
                            error = error.as_str(),
                            "optional step failed, continuing with default successor"
                        );
                        self.transition(instance, next, events).await
                    }
                    None => self.fail_instance(instance, step, &error, events).await,
                }
            }
            StepOutcome::Cancelled => {
                self.executor
                    .abandon_attempt(attempt, CANCELLED_MESSAGE)
                    .await?;
                self.close_open_work(instance, CANCELLED_MESSAGE).await?;

                instance.mark_cancelled(Utc::now());
                self.instances.save_instance(instance).await?;
                tracing::info!(instance_id = %instance.id, "instance cancelled");
                events.push(WorkflowEvent::InstanceCancelled {
                    instance_id: instance.id,
                });
                Ok(AdvanceOutcome::Cancelled)
            }
        }
    }

    /// Move to `next`, or complete the instance when there is no successor.
    async fn transition(
        &self,
        instance: &mut WorkflowInstance,
        next: Option<String>,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let now = Utc::now();
        match next {
            Some(next_step) => {
                tracing::debug!(
                    instance_id = %instance.id,
                    from = instance.current_step.as_deref().unwrap_or_default(),
                    to = next_step.as_str(),
                    "instance advanced"
                );
                instance.current_step = Some(next_step.clone());
                instance.updated_at = now;
                self.instances.save_instance(instance).await?;
                Ok(AdvanceOutcome::Advanced { next_step })
            }
            None => {
                instance.mark_completed(now);
                self.instances.save_instance(instance).await?;
                tracing::info!(instance_id = %instance.id, "instance completed");
                events.push(WorkflowEvent::InstanceCompleted {
                    instance_id: instance.id,
                });
                Ok(AdvanceOutcome::Completed)
            }
        }
    }

    async fn fail_instance(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepDefinition,
        error: &str,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let message = format!("step '{}': {error}", step.id);
        instance.mark_failed(&message, Utc::now());
        self.instances.save_instance(instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            step_id = step.id.as_str(),
            error = message.as_str(),
            "instance failed"
        );
        events.push(WorkflowEvent::InstanceFailed {
            instance_id: instance.id,
            error: message.clone(),
        });
        Ok(AdvanceOutcome::Failed { error: message })
    }

    /// Convert an internal error into an instance failure so no instance is
    /// left mid-transition. Caller errors pass through unchanged.
    async fn settle(
        &self,
        instance_id: &Uuid,
        result: Result<AdvanceOutcome, OrchestratorError>,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let err = match result {
            Err(err) if err.is_internal() => err,
            other => return other,
        };

        tracing::error!(instance_id = %instance_id, error = %err, "internal error while advancing instance");

        let mut instance = match self.instances.load_instance(instance_id).await {
            Ok(Some(instance)) if instance.is_running() => instance,
            _ => return Err(err),
        };
        let message = format!("internal error: {err}");
        if let Err(close_err) = self.close_open_work(&instance, &message).await {
            tracing::warn!(instance_id = %instance_id, error = %close_err, "failed to close open step work");
        }
        instance.mark_failed(&message, Utc::now());
        self.instances.save_instance(&instance).await?;

        events.push(WorkflowEvent::InstanceFailed {
            instance_id: instance.id,
            error: message.clone(),
        });
        Ok(AdvanceOutcome::Failed { error: message })
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cancel a running instance.
    ///
    /// Terminal instances are rejected with `InvalidTransition`. If an
    /// `advance()` in this process holds the lease, its cancellation token is
    /// set and `CancelRequested` is returned.
    pub async fn cancel(&self, instance_id: &Uuid) -> Result<CancelOutcome, OrchestratorError> {
        let lease = match self.acquire(instance_id).await {
            Ok(lease) => lease,
            Err(OrchestratorError::LockContention(id)) => {
                let token = self.in_flight.get(&id).map(|t| t.value().clone());
                return match token {
                    Some(token) => {
                        token.cancel();
                        tracing::info!(instance_id = %id, "cancellation requested for in-flight advance");
                        Ok(CancelOutcome::CancelRequested)
                    }
                    None => Err(OrchestratorError::LockContention(id)),
                };
            }
            Err(err) => return Err(err),
        };

        let mut events = Vec::new();
        let result = self.cancel_locked(instance_id, &mut events).await;
        self.release(&lease).await;
        self.publish(events);
        result
    }

    async fn cancel_locked(
        &self,
        instance_id: &Uuid,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<CancelOutcome, OrchestratorError> {
        let mut instance = self.load_instance(instance_id).await?;
        if !instance.is_running() {
            return Err(OrchestratorError::InvalidTransition {
                instance_id: instance.id,
                status: instance.status,
            });
        }

        self.close_open_work(&instance, CANCELLED_MESSAGE).await?;
        instance.mark_cancelled(Utc::now());
        self.instances.save_instance(&instance).await?;

        tracing::info!(instance_id = %instance.id, "instance cancelled");
        events.push(WorkflowEvent::InstanceCancelled {
            instance_id: instance.id,
        });
        Ok(CancelOutcome::Cancelled)
    }

    // -----------------------------------------------------------------------
    // Approvals
    // -----------------------------------------------------------------------

    /// Record a decision on a pending approval and resume the instance.
    ///
    /// Deciding a non-pending approval fails with `AlreadyDecided` and
    /// changes nothing.
    pub async fn record_decision(
        &self,
        approval_id: &Uuid,
        decision: &Decision,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let approval = self.load_pending_approval(approval_id).await?;
        let instance_id = approval.instance_id;

        let mut lease = self.acquire(&instance_id).await?;
        let token = self.register(&instance_id);
        let mut events = Vec::new();

        let result = self
            .decide_locked(&mut lease, &approval, decision, &token, &mut events)
            .await;
        let result = self.settle(&instance_id, result, &mut events).await;

        self.in_flight.remove(&instance_id);
        self.release(&lease).await;
        self.publish(events);
        result
    }

    async fn decide_locked(
        &self,
        lease: &mut Lease,
        approval: &Approval,
        decision: &Decision,
        token: &CancellationToken,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let instance = self.load_instance(&approval.instance_id).await?;
        if !instance.is_running() {
            return Err(OrchestratorError::InvalidTransition {
                instance_id: instance.id,
                status: instance.status,
            });
        }

        let decided = self.approvals.record_decision(&approval.id, decision).await?;
        events.push(WorkflowEvent::ApprovalDecided {
            approval_id: decided.id,
            instance_id: decided.instance_id,
            step_id: decided.step_id.clone(),
            approved: decided.status == ApprovalStatus::Approved,
            decided_by: decision.decided_by.clone(),
        });

        self.drive(lease, token, events).await
    }

    /// Hand a pending approval to another approver. Returns the new approval.
    pub async fn delegate(
        &self,
        approval_id: &Uuid,
        delegate_to: &str,
    ) -> Result<Approval, OrchestratorError> {
        let approval = self.load_pending_approval(approval_id).await?;
        let lease = self.acquire(&approval.instance_id).await?;

        let mut events = Vec::new();
        let result = self
            .delegate_locked(&approval, delegate_to, &mut events)
            .await;
        self.release(&lease).await;
        self.publish(events);
        result
    }

    async fn delegate_locked(
        &self,
        approval: &Approval,
        delegate_to: &str,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<Approval, OrchestratorError> {
        let instance = self.load_instance(&approval.instance_id).await?;
        if !instance.is_running() {
            return Err(OrchestratorError::InvalidTransition {
                instance_id: instance.id,
                status: instance.status,
            });
        }

        let (original, replacement) = self.approvals.delegate(&approval.id, delegate_to).await?;
        events.push(WorkflowEvent::ApprovalDelegated {
            approval_id: original.id,
            new_approval_id: replacement.id,
            instance_id: original.instance_id,
            step_id: original.step_id.clone(),
            delegate: delegate_to.to_string(),
        });
        Ok(replacement)
    }

    /// Escalate an approval if it is still pending and overdue at `now`.
    ///
    /// Approvals of instances that are no longer running are left alone.
    pub async fn escalate_approval(
        &self,
        approval_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Approval>, OrchestratorError> {
        let approval = match self.approvals.repo().get_approval(approval_id).await? {
            Some(approval) if approval.is_overdue(now) => approval,
            Some(_) => return Ok(None),
            None => return Err(OrchestratorError::ApprovalNotFound(*approval_id)),
        };
        let lease = self.acquire(&approval.instance_id).await?;

        let mut events = Vec::new();
        let result = self.escalate_locked(&approval, now, &mut events).await;
        self.release(&lease).await;
        self.publish(events);
        result
    }

    async fn escalate_locked(
        &self,
        approval: &Approval,
        now: DateTime<Utc>,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<Option<Approval>, OrchestratorError> {
        let instance = self.load_instance(&approval.instance_id).await?;
        if !instance.is_running() {
            return Ok(None);
        }

        let definition = self.pinned_definition(&instance).await?;
        let step = definition.step(&approval.step_id).ok_or_else(|| {
            OrchestratorError::Internal(format!(
                "approval step '{}' missing from definition",
                approval.step_id
            ))
        })?;
        let StepConfig::Approval(config) = &step.config else {
            return Err(OrchestratorError::Internal(format!(
                "step '{}' is not an approval step",
                step.id
            )));
        };

        let escalated = self
            .approvals
            .escalate(&approval.id, step, config, &instance.context, now)
            .await?;
        if let Some(escalated) = &escalated {
            events.push(WorkflowEvent::ApprovalEscalated {
                approval_id: escalated.id,
                instance_id: escalated.instance_id,
                step_id: escalated.step_id.clone(),
                new_level: escalated.escalation_level,
                new_approver: escalated.assigned_to.clone(),
            });
        }
        Ok(escalated)
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    /// Route a running attempt whose deadline has passed through the retry
    /// and failure path, as if its handler had timed out.
    ///
    /// Returns `None` when the attempt finished or moved on in the meantime.
    pub async fn expire_step(
        &self,
        attempt_id: &Uuid,
        instance_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>, OrchestratorError> {
        let lease = self.acquire(instance_id).await?;
        let mut events = Vec::new();

        let result = match self.expire_locked(attempt_id, instance_id, now, &mut events).await {
            Ok(Some(outcome)) => Ok(Some(outcome)),
            Ok(None) => Ok(None),
            Err(err) => self.settle(instance_id, Err(err), &mut events).await.map(Some),
        };

        self.release(&lease).await;
        self.publish(events);
        result
    }

    async fn expire_locked(
        &self,
        attempt_id: &Uuid,
        instance_id: &Uuid,
        now: DateTime<Utc>,
        events: &mut Vec<WorkflowEvent>,
    ) -> Result<Option<AdvanceOutcome>, OrchestratorError> {
        let Some(mut attempt) = self.instances.load_step(attempt_id).await? else {
            return Ok(None);
        };
        let overdue = attempt.status == StepStatus::Running
            && attempt.deadline_at.is_some_and(|deadline| deadline <= now);
        if !overdue {
            return Ok(None);
        }

        let mut instance = self.load_instance(instance_id).await?;
        if !instance.is_running() || instance.current_step.as_deref() != Some(attempt.step_id.as_str()) {
            self.executor
                .abandon_attempt(&mut attempt, "step no longer current")
                .await?;
            return Ok(None);
        }

        let definition = self.pinned_definition(&instance).await?;
        let step = current_step(&definition, &instance)?;
        tracing::warn!(
            instance_id = %instance.id,
            step_id = step.id.as_str(),
            attempt = attempt.attempt,
            "step attempt exceeded its deadline"
        );
        let error = self.executor.deadline_error(step);
        let outcome = self.executor.fail_attempt(step, &mut attempt, error).await?;
        self.apply(&mut instance, &definition, step, &mut attempt, outcome, events)
            .await
            .map(Some)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn acquire(&self, instance_id: &Uuid) -> Result<Lease, OrchestratorError> {
        match self.instances.lock(instance_id, self.lease_ttl).await {
            Ok(lease) => Ok(lease),
            Err(RepositoryError::LockHeld(id)) => {
                tracing::debug!(instance_id = %id, "instance lease held elsewhere");
                Err(OrchestratorError::LockContention(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, OrchestratorError> {
        match self.instances.renew(lease, ttl).await {
            Ok(renewed) => Ok(renewed),
            Err(RepositoryError::LeaseLost(id)) => {
                tracing::warn!(instance_id = %id, lease_id = %lease.lease_id, "instance lease lost");
                Err(OrchestratorError::LeaseLost(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(err) = self.instances.unlock(lease).await {
            tracing::warn!(
                instance_id = %lease.instance_id,
                error = %err,
                "failed to release instance lease; it will expire"
            );
        }
    }

    fn register(&self, instance_id: &Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.in_flight.insert(*instance_id, token.clone());
        token
    }

    fn publish(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    async fn load_instance(&self, instance_id: &Uuid) -> Result<WorkflowInstance, OrchestratorError> {
        self.instances
            .load_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(*instance_id))
    }

    async fn load_pending_approval(&self, approval_id: &Uuid) -> Result<Approval, OrchestratorError> {
        let approval = self
            .approvals
            .repo()
            .get_approval(approval_id)
            .await?
            .ok_or(OrchestratorError::ApprovalNotFound(*approval_id))?;
        if !approval.is_pending() {
            return Err(OrchestratorError::AlreadyDecided {
                approval_id: approval.id,
                status: approval.status,
            });
        }
        Ok(approval)
    }

    async fn pinned_definition(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowDefinition, OrchestratorError> {
        self.definitions
            .get_definition(&instance.definition_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Internal(format!(
                    "definition {} of instance {} is missing",
                    instance.definition_id, instance.id
                ))
            })
    }

    /// Fail the unfinished attempt of the instance's current step and close
    /// its pending approvals. Used when the instance stops running.
    async fn close_open_work(
        &self,
        instance: &WorkflowInstance,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        if let Some(step_id) = instance.current_step.as_deref() {
            if let Some(mut open) = self.instances.latest_step(&instance.id, step_id).await? {
                self.executor.abandon_attempt(&mut open, reason).await?;
            }
        }
        self.approvals
            .withdraw_pending(&instance.id, SYSTEM_ACTOR, reason)
            .await?;
        Ok(())
    }
}

fn current_step<'d>(
    definition: &'d WorkflowDefinition,
    instance: &WorkflowInstance,
) -> Result<&'d StepDefinition, OrchestratorError> {
    let step_id = instance.current_step.as_deref().ok_or_else(|| {
        OrchestratorError::Internal(format!("running instance {} has no current step", instance.id))
    })?;
    definition.step(step_id).ok_or_else(|| {
        OrchestratorError::Internal(format!(
            "step '{step_id}' not found in definition {}",
            definition.code
        ))
    })
}

/// The static successor of a step. An explicit `next` naming a step the
/// definition lacks is an error rather than the end of the instance.
fn static_next(
    definition: &WorkflowDefinition,
    step: &StepDefinition,
) -> Result<Option<String>, StepError> {
    match (&step.next, definition.static_successor(step)) {
        (_, Some(next)) => Ok(Some(next.id.clone())),
        (Some(target), None) if !step.terminal => Err(StepError::UnknownNextStep(target.clone())),
        _ => Ok(None),
    }
}

/// Where an optional step's terminal failure leads.
///
/// `Some(None)` means the instance ends there; `None` means there is no
/// default route at all (a condition step without a default condition).
fn default_successor(
    definition: &WorkflowDefinition,
    step: &StepDefinition,
) -> Option<Option<String>> {
    match &step.config {
        StepConfig::Condition(cfg) => cfg
            .default_condition()
            .map(|condition| condition.next_step.clone()),
        _ => static_next(definition, step).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::workflow::{Condition, ConditionOperator};

    fn definition_with(conditions: Vec<Condition>) -> WorkflowDefinition {
        let mut def: WorkflowDefinition = serde_yaml_ng::from_str(
            r#"
code: routing
name: Routing
steps:
  - id: route
    name: Route
    sequence: 1
    config:
      type: condition
      conditions:
        - sequence: 1
          field: x
          operator: "="
          value: 1
          next_step: done
  - id: done
    name: Done
    sequence: 2
    config:
      type: notification
      channel: log
      template: done
"#,
        )
        .unwrap();
        if let StepConfig::Condition(cfg) = &mut def.steps[0].config {
            cfg.conditions.extend(conditions);
        }
        def
    }

    #[test]
    fn condition_default_successor_follows_default_branch() {
        let def = definition_with(vec![Condition {
            sequence: 9,
            field: String::new(),
            operator: ConditionOperator::Eq,
            value: json!(null),
            next_step: Some("done".to_string()),
            is_default: true,
        }]);
        let route = def.step("route").unwrap();
        assert_eq!(default_successor(&def, route), Some(Some("done".to_string())));
    }

    #[test]
    fn condition_without_default_has_no_route() {
        let def = definition_with(Vec::new());
        let route = def.step("route").unwrap();
        assert_eq!(default_successor(&def, route), None);

        let done = def.step("done").unwrap();
        assert_eq!(default_successor(&def, done), Some(None));
    }

    #[test]
    fn internal_errors_are_classified() {
        assert!(OrchestratorError::Internal("boom".into()).is_internal());
        assert!(!OrchestratorError::LockContention(Uuid::nil()).is_internal());
        assert!(
            !OrchestratorError::from(ApprovalError::NotFound(Uuid::nil())).is_internal()
        );
    }
}
