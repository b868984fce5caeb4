//! In-memory implementation of every repository trait.
//!
//! `InMemoryStore` backs single-process deployments and the engine tests.
//! Locks live in a `DashMap` lease table, so mutual exclusion holds across
//! tasks and threads of one process. Write counters let tests use the store
//! as a spy.
//!
//! All reads return cloned values -- never hold a `DashMap` guard across await.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepwise_types::approval::{Approval, ApprovalStatus};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{InstanceStatus, InstanceStep, StepStatus, WorkflowInstance};
use stepwise_types::workflow::{DefinitionStatus, WorkflowDefinition};
use uuid::Uuid;

use super::approval::ApprovalRepository;
use super::definition::DefinitionStore;
use super::instance::{InstanceRepository, Lease};

/// Counts of mutating calls, per record family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub instances: usize,
    pub steps: usize,
    pub approvals: usize,
}

#[derive(Default)]
struct Inner {
    definitions: DashMap<Uuid, WorkflowDefinition>,
    instances: DashMap<Uuid, WorkflowInstance>,
    steps: DashMap<Uuid, InstanceStep>,
    approvals: DashMap<Uuid, Approval>,
    leases: DashMap<Uuid, Lease>,
    instance_writes: AtomicUsize,
    step_writes: AtomicUsize,
    approval_writes: AtomicUsize,
}

/// Shared in-memory store. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutating calls made so far (creates and saves).
    pub fn write_counts(&self) -> WriteCounts {
        WriteCounts {
            instances: self.inner.instance_writes.load(Ordering::SeqCst),
            steps: self.inner.step_writes.load(Ordering::SeqCst),
            approvals: self.inner.approval_writes.load(Ordering::SeqCst),
        }
    }

    /// Whether a live lease is held on the instance.
    pub fn is_locked(&self, instance_id: &Uuid) -> bool {
        self.inner
            .leases
            .get(instance_id)
            .is_some_and(|lease| !lease.is_expired(Utc::now()))
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("definitions", &self.inner.definitions.len())
            .field("instances", &self.inner.instances.len())
            .field("steps", &self.inner.steps.len())
            .field("approvals", &self.inner.approvals.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

impl DefinitionStore for InMemoryStore {
    async fn get_active_definition(
        &self,
        code: &str,
        tenant: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .inner
            .definitions
            .iter()
            .find(|d| d.code == code && d.tenant_id == tenant && d.is_active())
            .map(|d| d.value().clone()))
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.inner.definitions.get(id).map(|d| d.value().clone()))
    }

    async fn activate(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        let mut max_version = 0;
        for mut entry in self.inner.definitions.iter_mut() {
            if entry.code != def.code || entry.tenant_id != def.tenant_id {
                continue;
            }
            max_version = max_version.max(entry.version);
            if entry.status == DefinitionStatus::Active {
                entry.status = DefinitionStatus::Archived;
            }
        }

        if self.inner.definitions.contains_key(&def.id) {
            def.id = Uuid::now_v7();
        }
        def.version = max_version + 1;
        def.status = DefinitionStatus::Active;
        self.inner.definitions.insert(def.id, def.clone());
        Ok(def)
    }

    async fn list_definitions(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> = self
            .inner
            .definitions
            .iter()
            .filter(|d| tenant.is_none_or(|t| d.tenant_id == t))
            .map(|d| d.value().clone())
            .collect();
        defs.sort_by(|a, b| a.code.cmp(&b.code).then(b.version.cmp(&a.version)));
        Ok(defs)
    }
}

// ---------------------------------------------------------------------------
// Instances and steps
// ---------------------------------------------------------------------------

impl InstanceRepository for InMemoryStore {
    async fn lock(&self, instance_id: &Uuid, ttl: Duration) -> Result<Lease, RepositoryError> {
        let now = Utc::now();
        match self.inner.leases.entry(*instance_id) {
            Entry::Occupied(mut held) => {
                if !held.get().is_expired(now) {
                    return Err(RepositoryError::LockHeld(*instance_id));
                }
                let lease = Lease::new(*instance_id, ttl);
                held.insert(lease.clone());
                Ok(lease)
            }
            Entry::Vacant(slot) => {
                let lease = Lease::new(*instance_id, ttl);
                slot.insert(lease.clone());
                Ok(lease)
            }
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, RepositoryError> {
        match self.inner.leases.get_mut(&lease.instance_id) {
            Some(mut held) if held.lease_id == lease.lease_id => {
                let renewed = lease.renewed(ttl);
                *held = renewed.clone();
                Ok(renewed)
            }
            _ => Err(RepositoryError::LeaseLost(lease.instance_id)),
        }
    }

    async fn unlock(&self, lease: &Lease) -> Result<(), RepositoryError> {
        self.inner
            .leases
            .remove_if(&lease.instance_id, |_, held| held.lease_id == lease.lease_id);
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        match self.inner.instances.entry(instance.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                self.inner.instance_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn load_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.inner.instances.get(id).map(|i| i.value().clone()))
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        match self.inner.instances.get_mut(&instance.id) {
            Some(mut stored) => {
                *stored = instance.clone();
                self.inner.instance_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<WorkflowInstance> = self
            .inner
            .instances
            .iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .map(|i| i.value().clone())
            .collect();
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        instances.truncate(limit as usize);
        Ok(instances)
    }

    async fn save_step(&self, step: &InstanceStep) -> Result<(), RepositoryError> {
        self.inner.steps.insert(step.id, step.clone());
        self.inner.step_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_step(&self, id: &Uuid) -> Result<Option<InstanceStep>, RepositoryError> {
        Ok(self.inner.steps.get(id).map(|s| s.value().clone()))
    }

    async fn latest_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<InstanceStep>, RepositoryError> {
        Ok(self
            .inner
            .steps
            .iter()
            .filter(|s| s.instance_id == *instance_id && s.step_id == step_id)
            .max_by_key(|s| (s.created_at, s.attempt))
            .map(|s| s.value().clone()))
    }

    async fn list_steps(&self, instance_id: &Uuid) -> Result<Vec<InstanceStep>, RepositoryError> {
        let mut steps: Vec<InstanceStep> = self
            .inner
            .steps
            .iter()
            .filter(|s| s.instance_id == *instance_id)
            .map(|s| s.value().clone())
            .collect();
        steps.sort_by_key(|s| (s.created_at, s.attempt));
        Ok(steps)
    }

    async fn list_overdue_steps(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceStep>, RepositoryError> {
        Ok(self
            .inner
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running && s.deadline_at.is_some_and(|d| d <= now))
            .map(|s| s.value().clone())
            .collect())
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceStep>, RepositoryError> {
        Ok(self
            .inner
            .steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Pending && s.scheduled_at.is_some_and(|at| at <= now)
            })
            .map(|s| s.value().clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

impl ApprovalRepository for InMemoryStore {
    async fn create_approval(&self, approval: &Approval) -> Result<(), RepositoryError> {
        if approval.is_pending() {
            let duplicate = self.inner.approvals.iter().any(|a| {
                a.is_pending() && a.instance_id == approval.instance_id && a.step_id == approval.step_id
            });
            if duplicate {
                return Err(RepositoryError::Conflict(format!(
                    "pending approval already exists for step '{}'",
                    approval.step_id
                )));
            }
        }
        self.inner.approvals.insert(approval.id, approval.clone());
        self.inner.approval_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_approval(&self, approval: &Approval) -> Result<(), RepositoryError> {
        match self.inner.approvals.get_mut(&approval.id) {
            Some(mut stored) => {
                *stored = approval.clone();
                self.inner.approval_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_approval(&self, id: &Uuid) -> Result<Option<Approval>, RepositoryError> {
        Ok(self.inner.approvals.get(id).map(|a| a.value().clone()))
    }

    async fn latest_for_attempt(
        &self,
        instance_step_id: &Uuid,
    ) -> Result<Option<Approval>, RepositoryError> {
        Ok(self
            .inner
            .approvals
            .iter()
            .filter(|a| a.instance_step_id == *instance_step_id)
            .max_by_key(|a| (a.created_at, a.id))
            .map(|a| a.value().clone()))
    }

    async fn pending_for_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<Approval>, RepositoryError> {
        Ok(self
            .inner
            .approvals
            .iter()
            .find(|a| a.is_pending() && a.instance_id == *instance_id && a.step_id == step_id)
            .map(|a| a.value().clone()))
    }

    async fn list_pending(&self, assignee: Option<&str>) -> Result<Vec<Approval>, RepositoryError> {
        let mut pending: Vec<Approval> = self
            .inner
            .approvals
            .iter()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .filter(|a| assignee.is_none_or(|who| a.assigned_to == who))
            .map(|a| a.value().clone())
            .collect();
        pending.sort_by_key(|a| a.due_at);
        Ok(pending)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        let mut overdue: Vec<Approval> = self
            .inner
            .approvals
            .iter()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.value().clone())
            .collect();
        overdue.sort_by_key(|a| a.due_at);
        Ok(overdue)
    }

    async fn list_for_instance(&self, instance_id: &Uuid) -> Result<Vec<Approval>, RepositoryError> {
        let mut approvals: Vec<Approval> = self
            .inner
            .approvals
            .iter()
            .filter(|a| a.instance_id == *instance_id)
            .map(|a| a.value().clone())
            .collect();
        approvals.sort_by_key(|a| (a.created_at, a.id));
        Ok(approvals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use stepwise_types::workflow::TriggerType;

    fn definition(code: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            name: code.to_string(),
            code: code.to_string(),
            description: None,
            status: DefinitionStatus::Draft,
            trigger_type: TriggerType::Manual,
            target_entity_type: None,
            version: 1,
            steps: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_unlocked() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();

        let lease = store.lock(&id, Duration::from_secs(60)).await.unwrap();
        let second = store.lock(&id, Duration::from_secs(60)).await;
        assert!(matches!(second, Err(RepositoryError::LockHeld(held)) if held == id));

        store.unlock(&lease).await.unwrap();
        assert!(!store.is_locked(&id));
        assert!(store.lock(&id, Duration::from_secs(60)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();

        let stale = store.lock(&id, Duration::ZERO).await.unwrap();
        let fresh = store.lock(&id, Duration::from_secs(60)).await.unwrap();
        assert_ne!(stale.lease_id, fresh.lease_id);

        // The stale holder's unlock must not release the new lease.
        store.unlock(&stale).await.unwrap();
        assert!(store.is_locked(&id));
    }

    #[tokio::test]
    async fn renew_extends_only_the_current_holder() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();

        let stale = store.lock(&id, Duration::ZERO).await.unwrap();
        let renewed = store.renew(&stale, Duration::from_secs(60)).await.unwrap();
        assert_eq!(renewed.lease_id, stale.lease_id);
        assert!(store.is_locked(&id));

        store.unlock(&renewed).await.unwrap();
        let err = store.renew(&renewed, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::LeaseLost(lost) if lost == id));

        let lapsed = store.lock(&id, Duration::ZERO).await.unwrap();
        let _taken = store.lock(&id, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(
            store.renew(&lapsed, Duration::from_secs(60)).await,
            Err(RepositoryError::LeaseLost(_))
        ));
    }

    #[tokio::test]
    async fn activate_archives_previous_version() {
        let store = InMemoryStore::new();
        let v1 = store.activate(definition("onboarding")).await.unwrap();
        let v2 = store.activate(definition("onboarding")).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let active = store
            .get_active_definition("onboarding", "acme")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, v2.id);

        let old = store.get_definition(&v1.id).await.unwrap().unwrap();
        assert_eq!(old.status, DefinitionStatus::Archived);
    }
}
