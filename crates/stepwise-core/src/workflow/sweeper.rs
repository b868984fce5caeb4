//! Periodic timeout sweep.
//!
//! Each pass finds three kinds of stalled work and feeds it back through the
//! orchestrator, which takes the instance lease before touching anything:
//!
//! - running step attempts past their deadline (routed as handler timeouts)
//! - pending approvals past `due_at` (escalated)
//! - scheduled retry attempts that have become due (advanced)
//!
//! Instances locked by a worker are skipped and picked up on the next pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::approval::ApprovalRepository;
use crate::repository::definition::DefinitionStore;
use crate::repository::instance::InstanceRepository;

use super::orchestrator::{AdvanceOutcome, InstanceOrchestrator, OrchestratorError};

/// Counts from one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_steps: usize,
    pub escalated_approvals: usize,
    pub retried_steps: usize,
    /// Items skipped because another worker held the instance lease.
    pub skipped_contended: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct TimeoutSweeper<D, I, A>
where
    D: DefinitionStore,
    I: InstanceRepository,
    A: ApprovalRepository,
{
    orchestrator: Arc<InstanceOrchestrator<D, I, A>>,
}

impl<D, I, A> TimeoutSweeper<D, I, A>
where
    D: DefinitionStore,
    I: InstanceRepository,
    A: ApprovalRepository,
{
    pub fn new(orchestrator: Arc<InstanceOrchestrator<D, I, A>>) -> Self {
        Self { orchestrator }
    }

    /// Run one pass at the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one pass treating `now` as the current time.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.expire_steps(now, &mut report).await;
        self.escalate_approvals(now, &mut report).await;
        self.advance_due_retries(now, &mut report).await;

        if !report.is_empty() {
            tracing::info!(
                expired = report.expired_steps,
                escalated = report.escalated_approvals,
                retried = report.retried_steps,
                skipped = report.skipped_contended,
                errors = report.errors,
                "timeout sweep finished"
            );
        }
        report
    }

    async fn expire_steps(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let overdue = match self.orchestrator.instances().list_overdue_steps(now).await {
            Ok(steps) => steps,
            Err(err) => {
                tracing::error!(error = %err, "failed to list overdue steps");
                report.errors += 1;
                return;
            }
        };

        for attempt in overdue {
            match self
                .orchestrator
                .expire_step(&attempt.id, &attempt.instance_id, now)
                .await
            {
                Ok(Some(_)) => report.expired_steps += 1,
                Ok(None) => {}
                Err(err) => record_error(report, &attempt.instance_id, err),
            }
        }
    }

    async fn escalate_approvals(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let overdue = match self.orchestrator.approvals().repo().list_overdue(now).await {
            Ok(approvals) => approvals,
            Err(err) => {
                tracing::error!(error = %err, "failed to list overdue approvals");
                report.errors += 1;
                return;
            }
        };

        for approval in overdue {
            match self.orchestrator.escalate_approval(&approval.id, now).await {
                Ok(Some(_)) => report.escalated_approvals += 1,
                Ok(None) => {}
                Err(err) => record_error(report, &approval.instance_id, err),
            }
        }
    }

    async fn advance_due_retries(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let due = match self.orchestrator.instances().list_due_retries(now).await {
            Ok(steps) => steps,
            Err(err) => {
                tracing::error!(error = %err, "failed to list due retries");
                report.errors += 1;
                return;
            }
        };

        // One advance per instance per pass.
        let mut seen = HashSet::new();
        for attempt in due {
            if !seen.insert(attempt.instance_id) {
                continue;
            }
            match self.orchestrator.advance(&attempt.instance_id).await {
                Ok(AdvanceOutcome::NotRunning(_) | AdvanceOutcome::NotDue { .. }) => {}
                Ok(_) => report.retried_steps += 1,
                Err(err) => record_error(report, &attempt.instance_id, err),
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "timeout sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        tracing::info!("timeout sweeper stopped");
    }
}

fn record_error(report: &mut SweepReport, instance_id: &Uuid, err: OrchestratorError) {
    match err {
        OrchestratorError::LockContention(_) => report.skipped_contended += 1,
        err => {
            tracing::warn!(instance_id = %instance_id, error = %err, "sweep item failed");
            report.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report() {
        assert!(SweepReport::default().is_empty());
        let report = SweepReport {
            skipped_contended: 1,
            ..Default::default()
        };
        assert!(!report.is_empty());
    }

    #[test]
    fn contention_is_counted_as_skipped() {
        let mut report = SweepReport::default();
        record_error(&mut report, &Uuid::nil(), OrchestratorError::LockContention(Uuid::nil()));
        record_error(
            &mut report,
            &Uuid::nil(),
            OrchestratorError::InstanceNotFound(Uuid::nil()),
        );
        assert_eq!(report.skipped_contended, 1);
        assert_eq!(report.errors, 1);
    }
}
