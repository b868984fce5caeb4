//! Retry scheduling and deadline handling.

mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration as ChronoDuration, Utc};
use common::{Harness, count, test_config};
use serde_json::json;
use stepwise_core::repository::InstanceRepository;
use stepwise_core::workflow::orchestrator::AdvanceOutcome;
use stepwise_core::workflow::sweeper::TimeoutSweeper;
use stepwise_types::config::EngineConfig;
use stepwise_types::instance::{InstanceStatus, InstanceStep, StepStatus};
use stepwise_types::workflow::StepType;

fn single_step(handler: &str, max_retries: u32) -> String {
    format!(
        r#"
code: single
name: Single
steps:
  - id: a
    name: A
    sequence: 1
    max_retries: {max_retries}
    config: {{ type: action, handler: {handler} }}
"#
    )
}

#[tokio::test]
async fn retries_until_exhausted_then_fails() {
    let mut h = Harness::new();
    h.deploy(&single_step("fail", 2)).await;
    let instance = h.start("single", json!({})).await;

    for expected_attempt in [2, 3] {
        let outcome = h.orchestrator.advance(&instance.id).await.unwrap();
        assert!(
            matches!(outcome, AdvanceOutcome::RetryScheduled { attempt, .. } if attempt == expected_attempt),
            "{outcome:?}"
        );
    }
    let outcome = h.orchestrator.advance(&instance.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Failed { .. }), "{outcome:?}");
    assert_eq!(h.failing.calls.load(Ordering::SeqCst), 3);

    // Every attempt is kept.
    let steps = h.store.list_steps(&instance.id).await.unwrap();
    assert_eq!(steps.iter().map(|s| s.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Failed));

    let events = h.drain_events();
    assert_eq!(count(&events, "step.failed"), 1);
    assert_eq!(count(&events, "instance.failed"), 1);
}

#[tokio::test]
async fn scheduled_retry_is_not_run_early() {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 60_000;
    let h = Harness::with_config(config);
    h.deploy(&single_step("fail", 1)).await;
    let instance = h.start("single", json!({})).await;

    let outcome = h.orchestrator.advance(&instance.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::RetryScheduled { attempt: 2, .. }));

    let before = h.store.write_counts();
    let outcome = h.orchestrator.advance(&instance.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::NotDue { .. }), "{outcome:?}");
    assert_eq!(h.store.write_counts(), before);
    assert_eq!(h.failing.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn overdue_attempt_is_timed_out_and_retried_by_sweeper() {
    let h = Harness::new();
    h.deploy(&single_step("record", 1)).await;
    let instance = h.start("single", json!({})).await;

    // A worker started the attempt and vanished.
    let now = Utc::now();
    let mut attempt = InstanceStep::pending(instance.id, "a", StepType::Action, 1, now);
    attempt.status = StepStatus::Running;
    attempt.started_at = Some(now - ChronoDuration::minutes(10));
    attempt.deadline_at = Some(now - ChronoDuration::minutes(5));
    h.store.save_step(&attempt).await.unwrap();

    let sweeper = TimeoutSweeper::new(h.orchestrator.clone());
    let report = sweeper.sweep().await;
    assert_eq!(report.expired_steps, 1);

    // The retry was scheduled during that pass; the next pass runs it.
    let report = sweeper.sweep().await;
    assert_eq!(report.retried_steps, 1);

    let steps = h.store.list_steps(&instance.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert_eq!(
        steps[0].error.as_deref(),
        Some("handler 'record' timed out after 300s")
    );
    assert_eq!(steps[1].status, StepStatus::Completed);

    let done = h.store.load_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn overdue_attempt_without_retries_fails_instance() {
    let h = Harness::with_config(test_config());
    h.deploy(&single_step("record", 0)).await;
    let instance = h.start("single", json!({})).await;

    let now = Utc::now();
    let mut attempt = InstanceStep::pending(instance.id, "a", StepType::Action, 1, now);
    attempt.status = StepStatus::Running;
    attempt.deadline_at = Some(now - ChronoDuration::seconds(1));
    h.store.save_step(&attempt).await.unwrap();

    let report = TimeoutSweeper::new(h.orchestrator.clone()).sweep().await;
    assert_eq!(report.expired_steps, 1);

    let failed = h.store.load_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(
        failed.error.as_deref(),
        Some("step 'a': handler 'record' timed out after 300s")
    );
}

#[tokio::test]
async fn sweeper_skips_locked_instances() {
    let h = Harness::new();
    h.deploy(&single_step("record", 0)).await;
    let instance = h.start("single", json!({})).await;

    let now = Utc::now();
    let mut attempt = InstanceStep::pending(instance.id, "a", StepType::Action, 1, now);
    attempt.status = StepStatus::Running;
    attempt.deadline_at = Some(now - ChronoDuration::seconds(1));
    h.store.save_step(&attempt).await.unwrap();

    let lease = h
        .store
        .lock(&instance.id, std::time::Duration::from_secs(60))
        .await
        .unwrap();
    let sweeper = TimeoutSweeper::new(h.orchestrator.clone());
    let report = sweeper.sweep().await;
    assert_eq!(report.skipped_contended, 1);
    assert_eq!(report.expired_steps, 0);

    h.store.unlock(&lease).await.unwrap();
    let report = sweeper.sweep().await;
    assert_eq!(report.expired_steps, 1);
}
