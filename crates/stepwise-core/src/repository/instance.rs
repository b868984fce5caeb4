//! Instance repository trait definition.
//!
//! Defines the persistence boundary for workflow instances and their
//! per-attempt step records, plus the per-instance advancement lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{InstanceStatus, InstanceStep, WorkflowInstance};
use uuid::Uuid;

/// Proof of holding the advancement lock on one instance.
///
/// Leases expire so a crashed holder cannot block an instance forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub instance_id: Uuid,
    pub lease_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(instance_id: Uuid, ttl: Duration) -> Self {
        Self {
            instance_id,
            lease_id: Uuid::now_v7(),
            expires_at: expiry_after(ttl),
        }
    }

    /// The same lease with its expiry moved to `ttl` from now.
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: expiry_after(ttl),
            ..self.clone()
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Repository trait for instance persistence.
///
/// Covers three concerns:
/// - **Locking:** exclusive, expiring, cross-process lease per instance.
/// - **Instances:** create/load/save the instance record.
/// - **Steps:** append and update per-attempt step records.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait InstanceRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Acquire the advancement lock.
    ///
    /// Fails fast with `RepositoryError::LockHeld` when another holder owns a
    /// live lease. An expired lease is taken over.
    fn lock(
        &self,
        instance_id: &Uuid,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<Lease, RepositoryError>> + Send;

    /// Move the expiry of a lease the caller still holds to `ttl` from now.
    ///
    /// Fails with `RepositoryError::LeaseLost` once the lease has been taken
    /// over or released. A lapsed lease nobody took over is still renewed.
    fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<Lease, RepositoryError>> + Send;

    /// Release a lease. Releasing a lease that was already taken over is a no-op.
    fn unlock(
        &self,
        lease: &Lease,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Overwrite the instance record.
    fn save_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List instances, optionally filtered by status, newest first.
    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or update a step attempt record (keyed by its id).
    fn save_step(
        &self,
        step: &InstanceStep,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn load_step(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<InstanceStep>, RepositoryError>> + Send;

    /// The most recently created record of `step_id` within an instance.
    ///
    /// A step visited again after a loop starts a fresh attempt sequence, so
    /// recency (not attempt number) decides.
    fn latest_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<InstanceStep>, RepositoryError>> + Send;

    /// Full step history of an instance, oldest first.
    fn list_steps(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceStep>, RepositoryError>> + Send;

    /// `Running` attempts whose `deadline_at` is at or before `now`.
    fn list_overdue_steps(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceStep>, RepositoryError>> + Send;

    /// `Pending` attempts with a `scheduled_at` at or before `now`.
    fn list_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<InstanceStep>, RepositoryError>> + Send;
}
