//! Approval repository trait definition.

use chrono::{DateTime, Utc};
use stepwise_types::approval::Approval;
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

/// Storage for approval tasks.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ApprovalRepository: Send + Sync {
    fn create_approval(
        &self,
        approval: &Approval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite an existing approval.
    fn save_approval(
        &self,
        approval: &Approval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_approval(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// The most recently created approval for a step attempt.
    fn latest_for_attempt(
        &self,
        instance_step_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// The pending approval for an (instance, step) pair, if one exists.
    fn pending_for_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// Pending approvals, optionally for one assignee, oldest deadline first.
    fn list_pending(
        &self,
        assignee: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;

    /// Pending approvals whose `due_at` is before `now`.
    fn list_overdue(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;

    /// All approvals of an instance, oldest first.
    fn list_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;
}
