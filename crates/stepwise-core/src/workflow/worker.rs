//! Worker pool driving instances through the orchestrator.
//!
//! Instance ids arrive on a bounded mpsc queue. Each id becomes one
//! `advance()` call on a `JoinSet` task, with a `Semaphore` bounding how many
//! run at once. Depending on the outcome the id is re-enqueued:
//!
//! - `Advanced`: immediately, to run the next step
//! - `RetryScheduled`: after the retry delay
//! - `LockContention`: after a short backoff
//!
//! Terminal, waiting and no-op outcomes drop the id. Waiting instances come
//! back through `record_decision()` or the sweeper.

use std::sync::Arc;
use std::time::Duration;

use stepwise_types::config::EngineConfig;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::approval::ApprovalRepository;
use crate::repository::definition::DefinitionStore;
use crate::repository::instance::InstanceRepository;

use super::orchestrator::{AdvanceOutcome, InstanceOrchestrator, OrchestratorError};

/// Delay before retrying an instance whose lease was held elsewhere.
pub const CONTENTION_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("work queue is closed")]
    QueueClosed,
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// Cloneable handle for submitting instance ids to a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<Uuid>,
}

impl WorkQueue {
    /// Enqueue an instance, waiting for queue capacity.
    pub async fn enqueue(&self, instance_id: Uuid) -> Result<(), WorkerError> {
        self.tx
            .send(instance_id)
            .await
            .map_err(|_| WorkerError::QueueClosed)
    }

    /// Enqueue after `delay`, unless `shutdown` fires first.
    async fn requeue_after(&self, instance_id: Uuid, delay: Duration, shutdown: &CancellationToken) {
        if !delay.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = self.enqueue(instance_id) => {
                if result.is_err() {
                    tracing::debug!(instance_id = %instance_id, "work queue closed, dropping re-enqueue");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool<D, I, A>
where
    D: DefinitionStore,
    I: InstanceRepository,
    A: ApprovalRepository,
{
    orchestrator: Arc<InstanceOrchestrator<D, I, A>>,
    concurrency: usize,
    contention_backoff: Duration,
    queue: WorkQueue,
    rx: mpsc::Receiver<Uuid>,
}

impl<D, I, A> WorkerPool<D, I, A>
where
    D: DefinitionStore + 'static,
    I: InstanceRepository + 'static,
    A: ApprovalRepository + 'static,
{
    pub fn new(orchestrator: Arc<InstanceOrchestrator<D, I, A>>, config: &EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            orchestrator,
            concurrency: config.worker_concurrency.max(1),
            contention_backoff: CONTENTION_BACKOFF,
            queue: WorkQueue { tx },
            rx,
        }
    }

    /// Override the contention backoff.
    pub fn with_contention_backoff(mut self, backoff: Duration) -> Self {
        self.contention_backoff = backoff;
        self
    }

    /// A handle for submitting work.
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Process the queue until `shutdown` fires, then wait for in-flight
    /// advances to finish.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        tracing::info!(concurrency = self.concurrency, "worker pool started");

        loop {
            let instance_id = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "worker task panicked");
                    }
                    continue;
                }
                received = self.rx.recv() => match received {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let queue = self.queue.clone();
            let shutdown = shutdown.clone();
            let backoff = self.contention_backoff;

            tasks.spawn(async move {
                let result = orchestrator.advance(&instance_id).await;
                drop(permit);
                handle_result(instance_id, result, &queue, backoff, &shutdown).await;
            });
        }

        tracing::info!(in_flight = tasks.len(), "worker pool draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker task panicked");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn handle_result(
    instance_id: Uuid,
    result: Result<AdvanceOutcome, OrchestratorError>,
    queue: &WorkQueue,
    backoff: Duration,
    shutdown: &CancellationToken,
) {
    match result {
        Ok(AdvanceOutcome::Advanced { next_step }) => {
            tracing::debug!(instance_id = %instance_id, next_step = next_step.as_str(), "instance advanced");
            queue.requeue_after(instance_id, Duration::ZERO, shutdown).await;
        }
        Ok(AdvanceOutcome::RetryScheduled { attempt, delay }) => {
            tracing::debug!(
                instance_id = %instance_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "re-enqueue after retry delay"
            );
            queue.requeue_after(instance_id, delay, shutdown).await;
        }
        Ok(outcome) => {
            tracing::debug!(instance_id = %instance_id, outcome = ?outcome, "instance settled");
        }
        Err(OrchestratorError::LockContention(_)) => {
            tracing::warn!(
                instance_id = %instance_id,
                backoff_ms = backoff.as_millis() as u64,
                "instance locked, re-enqueueing"
            );
            queue.requeue_after(instance_id, backoff, shutdown).await;
        }
        Err(OrchestratorError::LeaseLost(_)) => {
            tracing::warn!(instance_id = %instance_id, "lease taken over mid-step, leaving instance to its new holder");
        }
        Err(err) => {
            tracing::error!(instance_id = %instance_id, error = %err, "advance failed");
        }
    }
}
