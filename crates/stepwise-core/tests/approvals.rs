//! Approval step scenarios: decisions, escalation and delegation.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{Harness, count};
use serde_json::json;
use stepwise_core::repository::{ApprovalRepository, InstanceRepository};
use stepwise_core::workflow::orchestrator::{AdvanceOutcome, OrchestratorError};
use stepwise_core::workflow::sweeper::TimeoutSweeper;
use stepwise_types::approval::{ApprovalStatus, Decision};
use stepwise_types::event::WorkflowEvent;
use stepwise_types::instance::{InstanceStatus, StepStatus};
use uuid::Uuid;

fn review(required: bool) -> String {
    format!(
        r#"
code: purchase
name: Purchase approval
steps:
  - id: review
    name: Manager review
    sequence: 1
    required: {required}
    timeout_secs: 3600
    config:
      type: approval
      approvers: [alice]
  - id: order
    name: Place order
    sequence: 2
    config: {{ type: action, handler: record, params: {{ ordered: true }} }}
"#
    )
}

async fn waiting_on_review(h: &Harness, required: bool) -> (Uuid, Uuid) {
    h.deploy(&review(required)).await;
    let instance = h.start("purchase", json!({"amount": 1200})).await;
    let outcome = h.orchestrator.advance(&instance.id).await.unwrap();
    let AdvanceOutcome::Waiting { approval_id } = outcome else {
        panic!("expected waiting, got {outcome:?}");
    };
    (instance.id, approval_id)
}

#[tokio::test]
async fn approval_step_waits_then_resumes_on_approval() {
    let mut h = Harness::new();
    let (instance_id, approval_id) = waiting_on_review(&h, true).await;

    let approval = h.store.get_approval(&approval_id).await.unwrap().unwrap();
    assert_eq!(approval.assigned_to, "alice");
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert!(!h.store.is_locked(&instance_id));

    // Advancing again while waiting neither duplicates the task nor moves on.
    let again = h.orchestrator.advance(&instance_id).await.unwrap();
    assert_eq!(again, AdvanceOutcome::Waiting { approval_id });
    assert_eq!(h.store.list_for_instance(&instance_id).await.unwrap().len(), 1);

    let decision = Decision::approve("alice").with_payload(json!({"budget_code": "OPS-7"}));
    let outcome = h.orchestrator.record_decision(&approval_id, &decision).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced { next_step: "order".into() });

    let instance = h.store.load_instance(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.context["budget_code"], "OPS-7");

    let events = h.drain_events();
    assert_eq!(count(&events, "approval.requested"), 1);
    assert_eq!(count(&events, "approval.decided"), 1);
    assert_eq!(count(&events, "step.completed"), 1);
}

#[tokio::test]
async fn deciding_twice_is_rejected() {
    let h = Harness::new();
    let (_, approval_id) = waiting_on_review(&h, true).await;

    h.orchestrator
        .record_decision(&approval_id, &Decision::approve("alice"))
        .await
        .unwrap();
    let before = h.store.write_counts();

    let err = h
        .orchestrator
        .record_decision(&approval_id, &Decision::reject("bob", "too late"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::AlreadyDecided { status: ApprovalStatus::Approved, .. }
    ));
    assert_eq!(h.store.write_counts(), before);
}

#[tokio::test]
async fn rejection_of_required_approval_fails_instance() {
    let h = Harness::new();
    let (instance_id, approval_id) = waiting_on_review(&h, true).await;

    let outcome = h
        .orchestrator
        .record_decision(&approval_id, &Decision::reject("alice", "over budget"))
        .await
        .unwrap();
    let AdvanceOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(error, "step 'review': rejected by alice: over budget");

    let instance = h.store.load_instance(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    let attempt = h.store.latest_step(&instance_id, "review").await.unwrap().unwrap();
    assert_eq!(attempt.status, StepStatus::Failed);
}

#[tokio::test]
async fn rejection_of_optional_approval_moves_on() {
    let h = Harness::new();
    let (instance_id, approval_id) = waiting_on_review(&h, false).await;

    let outcome = h
        .orchestrator
        .record_decision(&approval_id, &Decision::reject("alice", "not needed"))
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced { next_step: "order".into() });
    let instance = h.store.load_instance(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
}

#[tokio::test]
async fn overdue_approval_escalates_to_fallback() {
    let mut h = Harness::new();
    let (instance_id, approval_id) = waiting_on_review(&h, true).await;
    h.drain_events();

    let sweeper = TimeoutSweeper::new(h.orchestrator.clone());

    // Not yet due: nothing happens.
    let early = sweeper.sweep_at(Utc::now() + ChronoDuration::minutes(30)).await;
    assert_eq!(early.escalated_approvals, 0);

    let later = Utc::now() + ChronoDuration::hours(2);
    let report = sweeper.sweep_at(later).await;
    assert_eq!(report.escalated_approvals, 1);
    assert_eq!(report.errors, 0);

    let approval = h.store.get_approval(&approval_id).await.unwrap().unwrap();
    assert_eq!(approval.escalation_level, 1);
    assert_eq!(approval.assigned_to, "workflow-admin");
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert!(approval.due_at > later);

    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        WorkflowEvent::ApprovalEscalated { new_level: 1, new_approver, .. } if new_approver == "workflow-admin"
    ));

    // The extended deadline has not passed yet.
    let report = sweeper.sweep_at(later).await;
    assert_eq!(report.escalated_approvals, 0);

    let instance = h.store.load_instance(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
}

#[tokio::test]
async fn delegation_keeps_one_pending_approval() {
    let mut h = Harness::new();
    let (instance_id, approval_id) = waiting_on_review(&h, true).await;

    let replacement = h.orchestrator.delegate(&approval_id, "carol").await.unwrap();
    assert_eq!(replacement.assigned_to, "carol");
    assert_ne!(replacement.id, approval_id);

    let original = h.store.get_approval(&approval_id).await.unwrap().unwrap();
    assert_eq!(original.status, ApprovalStatus::Delegated);
    assert_eq!(original.delegate.as_deref(), Some("carol"));

    let pending: Vec<_> = h
        .store
        .list_for_instance(&instance_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.is_pending())
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, replacement.id);

    // The delegate's decision resumes the instance.
    let outcome = h
        .orchestrator
        .record_decision(&replacement.id, &Decision::approve("carol"))
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced { next_step: "order".into() });
    assert_eq!(count(&h.drain_events(), "approval.delegated"), 1);
}

#[tokio::test]
async fn decision_on_cancelled_instance_is_rejected() {
    let h = Harness::new();
    let (instance_id, approval_id) = waiting_on_review(&h, true).await;
    h.orchestrator.cancel(&instance_id).await.unwrap();

    // Cancelling closed the task; a late decision changes nothing.
    let approval = h.store.get_approval(&approval_id).await.unwrap().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Rejected);
    assert_eq!(approval.decided_by.as_deref(), Some("system"));
    assert_eq!(approval.comment.as_deref(), Some("instance cancelled"));
    assert!(h.store.list_pending(None).await.unwrap().is_empty());

    let err = h
        .orchestrator
        .record_decision(&approval_id, &Decision::approve("alice"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::AlreadyDecided { status: ApprovalStatus::Rejected, .. }
    ));
    let instance = h.store.load_instance(&instance_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
}

#[tokio::test]
async fn sweeper_ignores_approvals_of_cancelled_instance() {
    let mut h = Harness::new();
    let (instance_id, _) = waiting_on_review(&h, true).await;
    h.orchestrator.cancel(&instance_id).await.unwrap();
    h.drain_events();

    let later = Utc::now() + ChronoDuration::hours(2);
    assert!(h.store.list_overdue(later).await.unwrap().is_empty());

    let sweeper = TimeoutSweeper::new(h.orchestrator.clone());
    for _ in 0..2 {
        let report = sweeper.sweep_at(later).await;
        assert!(report.is_empty(), "{report:?}");
    }
    assert!(h.drain_events().is_empty());
}
