//! Step executor for the four workflow step types.
//!
//! `StepExecutor` runs one attempt of one step: it marks the attempt running,
//! dispatches on the `StepConfig` variant, records the result on the attempt
//! record, and consults the `RetryPolicy` when a retryable failure occurs.
//!
//! Step types: Action, Condition, Approval, Notification.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{InstanceStep, StepStatus, WorkflowInstance};
use stepwise_types::workflow::{StepConfig, StepDefinition};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::repository::approval::ApprovalRepository;
use crate::repository::instance::InstanceRepository;

use super::approval::{ApprovalError, ApprovalManager, ApprovalState};
use super::condition::{ConditionError, ConditionEvaluator};
use super::context::resolve_template;
use super::handler::ActionHandlerRegistry;
use super::notify::{Notification, NotificationDispatcher};
use super::retry::{RetryDecision, RetryPolicy};

/// Error recorded on an attempt cancelled mid-flight.
pub const CANCELLED_MESSAGE: &str = "instance cancelled";

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a step attempt failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("handler '{handler}' timed out after {timeout_secs}s")]
    HandlerTimeout { handler: String, timeout_secs: u64 },

    #[error("handler '{handler}' failed: {message}")]
    HandlerError { handler: String, message: String },

    #[error("handler '{handler}' rejected its parameters: {message}")]
    InvalidParams { handler: String, message: String },

    #[error("no action handler registered as '{0}'")]
    UnknownHandler(String),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// A branch points at a step the definition does not contain.
    #[error("branch target '{0}' does not exist")]
    UnknownBranchTarget(String),

    /// A step's `next` link points at a step the definition does not contain.
    #[error("next step '{0}' does not exist")]
    UnknownNextStep(String),

    #[error("rejected by {decided_by}{}", .comment.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    Rejected {
        decided_by: String,
        comment: Option<String>,
    },

    #[error("notification dispatch failed: {0}")]
    Notification(String),
}

impl StepError {
    /// Whether the retry policy applies. Definition defects and human
    /// rejections fail the attempt terminally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::HandlerTimeout { .. }
                | StepError::HandlerError { .. }
                | StepError::Notification(_)
        )
    }
}

/// Infrastructure failure while executing a step. Not a step outcome: the
/// orchestrator converts it into an instance failure.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Result of executing one step attempt.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The attempt completed; `output` is merged into the instance context.
    Completed { output: Value },
    /// A condition step chose a branch. `next_step: None` ends the instance.
    Branched {
        next_step: Option<String>,
        output: Value,
    },
    /// An approval task is pending; the attempt stays `Running`.
    Waiting {
        approval: stepwise_types::approval::Approval,
        created: bool,
    },
    /// The attempt failed and a new pending attempt was appended.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The attempt failed terminally.
    Failed { error: String },
    /// The instance was cancelled while the handler ran; its result was discarded.
    Cancelled,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual step attempts by dispatching to type-specific handlers.
pub struct StepExecutor<I: InstanceRepository, A: ApprovalRepository> {
    instances: I,
    approvals: Arc<ApprovalManager<A>>,
    handlers: ActionHandlerRegistry,
    notifier: Arc<dyn NotificationDispatcher>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

impl<I: InstanceRepository, A: ApprovalRepository> StepExecutor<I, A> {
    pub fn new(
        instances: I,
        approvals: Arc<ApprovalManager<A>>,
        handlers: ActionHandlerRegistry,
        notifier: Arc<dyn NotificationDispatcher>,
        retry: RetryPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            instances,
            approvals,
            handlers,
            notifier,
            retry,
            default_timeout,
        }
    }

    pub fn handlers(&self) -> &ActionHandlerRegistry {
        &self.handlers
    }

    /// Handler timeout of a step, falling back to the engine default.
    pub fn timeout_for(&self, step: &StepDefinition) -> Duration {
        step.timeout_or(self.default_timeout)
    }

    /// Execute one attempt and record its result.
    ///
    /// `cancel` is checked once the action handler returns; a cancelled
    /// instance gets `StepOutcome::Cancelled` and the attempt is left for the
    /// caller to close with [`Self::abandon_attempt`].
    pub async fn execute(
        &self,
        instance: &WorkflowInstance,
        step: &StepDefinition,
        attempt: &mut InstanceStep,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ExecutorError> {
        let now = Utc::now();
        let timeout = self.timeout_for(step);

        if attempt.status == StepStatus::Pending {
            attempt.status = StepStatus::Running;
            attempt.started_at = Some(now);
            attempt.input = Value::Object(instance.context.clone());
            if matches!(step.config, StepConfig::Action(_)) {
                attempt.deadline_at = Some(after(now, timeout));
            }
            self.instances.save_step(attempt).await?;

            tracing::debug!(
                instance_id = %instance.id,
                step_id = step.id.as_str(),
                attempt = attempt.attempt,
                step_type = %step.step_type(),
                "step attempt started"
            );
        } else if attempt.deadline_at.is_some_and(|deadline| deadline <= now) {
            // A running action whose holder vanished past its deadline.
            let error = self.deadline_error(step);
            return self.fail_attempt(step, attempt, error).await;
        }

        let result = match &step.config {
            StepConfig::Action(cfg) => {
                let result = self.handlers.invoke(cfg, &instance.context, timeout).await;
                if cancel.is_cancelled() {
                    return Ok(StepOutcome::Cancelled);
                }
                result.map(|output| StepOutcome::Completed { output })
            }
            StepConfig::Condition(cfg) => ConditionEvaluator::select(&instance.context, &cfg.conditions)
                .map(|chosen| StepOutcome::Branched {
                    next_step: chosen.next_step.clone(),
                    output: json!({
                        "next_step": chosen.next_step,
                        "condition": chosen.sequence,
                        "is_default": chosen.is_default,
                    }),
                })
                .map_err(StepError::from),
            StepConfig::Approval(cfg) => {
                match self
                    .approvals
                    .resolve_or_request(attempt, step, cfg, &instance.context)
                    .await?
                {
                    ApprovalState::Waiting { approval, created } => {
                        return Ok(StepOutcome::Waiting { approval, created });
                    }
                    ApprovalState::Approved(approval) => Ok(StepOutcome::Completed {
                        output: approval.decision.unwrap_or(Value::Null),
                    }),
                    ApprovalState::Rejected(approval) => Err(StepError::Rejected {
                        decided_by: approval.decided_by.unwrap_or(approval.assigned_to),
                        comment: approval.comment,
                    }),
                }
            }
            StepConfig::Notification(cfg) => {
                let notification = Notification {
                    instance_id: instance.id,
                    step_id: step.id.clone(),
                    channel: cfg.channel.clone(),
                    recipients: cfg.recipients.clone(),
                    message: resolve_template(&cfg.template, &instance.context),
                };
                self.notifier
                    .dispatch(&notification)
                    .await
                    .map(|()| StepOutcome::Completed {
                        output: Value::Null,
                    })
                    .map_err(StepError::Notification)
            }
        };

        match result {
            Ok(outcome) => {
                let output = match &outcome {
                    StepOutcome::Completed { output } | StepOutcome::Branched { output, .. } => {
                        output.clone()
                    }
                    _ => Value::Null,
                };
                attempt.mark_completed(output, Utc::now());
                self.instances.save_step(attempt).await?;
                tracing::debug!(
                    instance_id = %instance.id,
                    step_id = step.id.as_str(),
                    attempt = attempt.attempt,
                    "step attempt completed"
                );
                Ok(outcome)
            }
            Err(error) => self.fail_attempt(step, attempt, error).await,
        }
    }

    /// The error recorded when an attempt outlives its deadline.
    pub fn deadline_error(&self, step: &StepDefinition) -> StepError {
        let handler = match &step.config {
            StepConfig::Action(cfg) => cfg.handler.clone(),
            _ => step.step_type().to_string(),
        };
        StepError::HandlerTimeout {
            handler,
            timeout_secs: step.timeout_or(self.default_timeout).as_secs(),
        }
    }

    /// Close a failed attempt, scheduling a retry if the policy allows one.
    pub async fn fail_attempt(
        &self,
        step: &StepDefinition,
        attempt: &mut InstanceStep,
        error: StepError,
    ) -> Result<StepOutcome, ExecutorError> {
        let now = Utc::now();
        let message = error.to_string();
        attempt.mark_failed(&message, now);
        self.instances.save_step(attempt).await?;

        if error.is_retryable() {
            if let RetryDecision::Retry(delay) = self.retry.decide(attempt.attempt, step.max_retries) {
                let mut next = InstanceStep::pending(
                    attempt.instance_id,
                    &attempt.step_id,
                    attempt.step_type,
                    attempt.attempt + 1,
                    now,
                );
                next.scheduled_at = Some(after(now, delay));
                self.instances.save_step(&next).await?;

                tracing::warn!(
                    instance_id = %attempt.instance_id,
                    step_id = step.id.as_str(),
                    attempt = attempt.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = message.as_str(),
                    "step attempt failed, retry scheduled"
                );
                return Ok(StepOutcome::RetryScheduled {
                    attempt: next.attempt,
                    delay,
                    error: message,
                });
            }
        }

        tracing::debug!(
            instance_id = %attempt.instance_id,
            step_id = step.id.as_str(),
            attempt = attempt.attempt,
            error = message.as_str(),
            "step attempt failed terminally"
        );
        Ok(StepOutcome::Failed { error: message })
    }

    /// Close an unfinished attempt that will never run to completion.
    pub async fn abandon_attempt(
        &self,
        attempt: &mut InstanceStep,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        if attempt.status.is_finished() {
            return Ok(());
        }
        attempt.mark_failed(reason, Utc::now());
        self.instances.save_step(attempt).await?;
        Ok(())
    }

    /// Rebuild the outcome of an attempt that finished before its instance
    /// record was updated (the previous holder stopped in between).
    pub fn replay(&self, step: &StepDefinition, attempt: &InstanceStep) -> Option<StepOutcome> {
        match attempt.status {
            StepStatus::Completed => {
                let output = attempt.output.clone().unwrap_or(Value::Null);
                Some(match step.config {
                    StepConfig::Condition(_) => StepOutcome::Branched {
                        next_step: output["next_step"].as_str().map(str::to_string),
                        output,
                    },
                    _ => StepOutcome::Completed { output },
                })
            }
            StepStatus::Failed => Some(StepOutcome::Failed {
                error: attempt.error.clone().unwrap_or_default(),
            }),
            StepStatus::Pending | StepStatus::Running => None,
        }
    }
}

/// `now + delay`, saturating at the maximum representable time.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use serde_json::Map;
    use stepwise_types::config::ApprovalDefaults;
    use stepwise_types::workflow::{
        ActionConfig, Condition, ConditionConfig, ConditionOperator, NotificationConfig, StepType,
    };
    use uuid::Uuid;

    use crate::repository::memory::InMemoryStore;
    use crate::workflow::actor::DeclaredApprovers;
    use crate::workflow::handler::{ActionError, ActionHandler};

    struct Flaky;

    impl ActionHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn invoke(
            &self,
            _params: &Value,
            _context: &Map<String, Value>,
        ) -> Result<Value, ActionError> {
            Err(ActionError::Failed("upstream 503".to_string()))
        }
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<Notification>>);

    impl NotificationDispatcher for Outbox {
        fn dispatch<'a>(
            &'a self,
            notification: &'a Notification,
        ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
            Box::pin(async move {
                self.0.lock().unwrap().push(notification.clone());
                Ok(())
            })
        }
    }

    fn executor(store: &InMemoryStore, outbox: Arc<Outbox>) -> StepExecutor<InMemoryStore, InMemoryStore> {
        let approvals = Arc::new(ApprovalManager::new(
            store.clone(),
            Arc::new(DeclaredApprovers),
            ApprovalDefaults::default(),
        ));
        StepExecutor::new(
            store.clone(),
            approvals,
            ActionHandlerRegistry::new().with(Flaky),
            outbox,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1)),
            Duration::from_secs(5),
        )
    }

    fn instance(context: Value) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_code: "test".to_string(),
            definition_version: 1,
            tenant_id: "acme".to_string(),
            status: stepwise_types::instance::InstanceStatus::Running,
            entity: stepwise_types::instance::EntityRef {
                entity_type: "order".to_string(),
                entity_id: "1".to_string(),
            },
            context: match context {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            current_step: None,
            started_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
            error: None,
        }
    }

    fn step(id: &str, max_retries: u32, config: StepConfig) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            sequence: 1,
            required: true,
            timeout_secs: None,
            max_retries,
            next: None,
            terminal: false,
            config,
        }
    }

    #[tokio::test]
    async fn retryable_failure_appends_scheduled_attempt() {
        let store = InMemoryStore::new();
        let exec = executor(&store, Arc::new(Outbox::default()));
        let inst = instance(json!({}));
        let def = step(
            "charge",
            1,
            StepConfig::Action(ActionConfig {
                handler: "flaky".to_string(),
                params: Value::Null,
            }),
        );
        let mut attempt = InstanceStep::pending(inst.id, "charge", StepType::Action, 1, Utc::now());

        let outcome = exec
            .execute(&inst, &def, &mut attempt, &CancellationToken::new())
            .await
            .unwrap();
        let StepOutcome::RetryScheduled { attempt: next, delay, .. } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(next, 2);
        assert_eq!(delay, Duration::from_millis(20));
        assert_eq!(attempt.status, StepStatus::Failed);

        let mut second = store.latest_step(&inst.id, "charge").await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.status, StepStatus::Pending);
        assert!(second.scheduled_at.is_some());

        let outcome = exec
            .execute(&inst, &def, &mut second, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { ref error } if error.contains("upstream 503")));
        assert_eq!(store.list_steps(&inst.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn condition_without_match_fails_without_retry() {
        let store = InMemoryStore::new();
        let exec = executor(&store, Arc::new(Outbox::default()));
        let inst = instance(json!({"amount": 5}));
        let def = step(
            "route",
            3,
            StepConfig::Condition(ConditionConfig {
                conditions: vec![Condition {
                    sequence: 1,
                    field: "amount".to_string(),
                    operator: ConditionOperator::Gt,
                    value: json!(100),
                    next_step: Some("big".to_string()),
                    is_default: false,
                }],
            }),
        );
        let mut attempt = InstanceStep::pending(inst.id, "route", StepType::Condition, 1, Utc::now());

        let outcome = exec
            .execute(&inst, &def, &mut attempt, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { ref error } if error.contains("no matching branch")));
        assert_eq!(store.list_steps(&inst.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notification_renders_template_and_completes() {
        let store = InMemoryStore::new();
        let outbox = Arc::new(Outbox::default());
        let exec = executor(&store, outbox.clone());
        let inst = instance(json!({"order": {"id": "PO-7"}}));
        let def = step(
            "notify",
            0,
            StepConfig::Notification(NotificationConfig {
                channel: "email".to_string(),
                recipients: vec!["buyer@example.com".to_string()],
                template: "Order {{ order.id }} approved".to_string(),
            }),
        );
        let mut attempt =
            InstanceStep::pending(inst.id, "notify", StepType::Notification, 1, Utc::now());

        let outcome = exec
            .execute(&inst, &def, &mut attempt, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { output: Value::Null }));
        assert_eq!(attempt.status, StepStatus::Completed);

        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, "Order PO-7 approved");
    }

    #[test]
    fn rejection_message_includes_comment() {
        let err = StepError::Rejected {
            decided_by: "alice".to_string(),
            comment: Some("over budget".to_string()),
        };
        assert_eq!(err.to_string(), "rejected by alice: over budget");
        assert!(!err.is_retryable());
    }
}
