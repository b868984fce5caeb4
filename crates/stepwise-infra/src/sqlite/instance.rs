//! SQLite instance repository.
//!
//! Instances and their per-attempt step records, plus the cross-process
//! advancement lease. A lease row is taken with a single conditional upsert:
//! the insert succeeds when no row exists, and the update only fires when the
//! existing lease has expired. Zero affected rows means someone else holds it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::repository::instance::{InstanceRepository, Lease};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{EntityRef, InstanceStatus, InstanceStep, WorkflowInstance};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::row::{
    enum_str, format_datetime, parse_datetime, parse_enum, parse_json, parse_opt_datetime,
    parse_uuid, to_json, write_error,
};

/// SQLite-backed implementation of `InstanceRepository`.
#[derive(Clone)]
pub struct SqliteInstanceRepository {
    pool: DatabasePool,
}

impl SqliteInstanceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct InstanceRow {
    id: String,
    definition_id: String,
    definition_code: String,
    definition_version: i64,
    tenant_id: String,
    status: String,
    entity_type: String,
    entity_id: String,
    context: String,
    current_step: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    failed_at: Option<String>,
    cancelled_at: Option<String>,
    updated_at: String,
    error: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_code: row.try_get("definition_code")?,
            definition_version: row.try_get("definition_version")?,
            tenant_id: row.try_get("tenant_id")?,
            status: row.try_get("status")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            context: row.try_get("context")?,
            current_step: row.try_get("current_step")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            updated_at: row.try_get("updated_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: parse_uuid(&self.definition_id)?,
            definition_code: self.definition_code,
            definition_version: self.definition_version as u32,
            tenant_id: self.tenant_id,
            status: parse_enum(&self.status, "instance status")?,
            entity: EntityRef {
                entity_type: self.entity_type,
                entity_id: self.entity_id,
            },
            context: parse_json(&self.context, "instance context")?,
            current_step: self.current_step,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_opt_datetime(self.completed_at.as_deref())?,
            failed_at: parse_opt_datetime(self.failed_at.as_deref())?,
            cancelled_at: parse_opt_datetime(self.cancelled_at.as_deref())?,
            updated_at: parse_datetime(&self.updated_at)?,
            error: self.error,
        })
    }
}

struct StepRow {
    id: String,
    instance_id: String,
    step_id: String,
    step_type: String,
    status: String,
    attempt: i64,
    input: String,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    deadline_at: Option<String>,
    scheduled_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            step_type: row.try_get("step_type")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            deadline_at: row.try_get("deadline_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
        })
    }

    fn into_step(self) -> Result<InstanceStep, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(|s| parse_json(s, "step output"))
            .transpose()?;

        Ok(InstanceStep {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            step_type: parse_enum(&self.step_type, "step type")?,
            status: parse_enum(&self.status, "step status")?,
            attempt: self.attempt as u32,
            input: parse_json(&self.input, "step input")?,
            output,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_opt_datetime(self.started_at.as_deref())?,
            completed_at: parse_opt_datetime(self.completed_at.as_deref())?,
            deadline_at: parse_opt_datetime(self.deadline_at.as_deref())?,
            scheduled_at: parse_opt_datetime(self.scheduled_at.as_deref())?,
        })
    }
}

fn decode_instances(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowInstance>, RepositoryError> {
    rows.iter()
        .map(|row| {
            InstanceRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_instance()
        })
        .collect()
}

fn decode_steps(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<InstanceStep>, RepositoryError> {
    rows.iter()
        .map(|row| {
            StepRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_step()
        })
        .collect()
}

const INSTANCE_COLUMNS: &str = "id, definition_id, definition_code, definition_version, tenant_id, \
    status, entity_type, entity_id, context, current_step, started_at, completed_at, failed_at, \
    cancelled_at, updated_at, error";

const STEP_COLUMNS: &str = "id, instance_id, step_id, step_type, status, attempt, input, output, \
    error, created_at, started_at, completed_at, deadline_at, scheduled_at";

// ---------------------------------------------------------------------------
// InstanceRepository impl
// ---------------------------------------------------------------------------

impl InstanceRepository for SqliteInstanceRepository {
    async fn lock(&self, instance_id: &Uuid, ttl: Duration) -> Result<Lease, RepositoryError> {
        let lease = Lease::new(*instance_id, ttl);
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"INSERT INTO instance_leases (instance_id, lease_id, expires_at)
               VALUES (?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 lease_id = excluded.lease_id,
                 expires_at = excluded.expires_at
               WHERE instance_leases.expires_at <= ?"#,
        )
        .bind(instance_id.to_string())
        .bind(lease.lease_id.to_string())
        .bind(format_datetime(&lease.expires_at))
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::LockHeld(*instance_id));
        }
        tracing::trace!(instance_id = %instance_id, lease_id = %lease.lease_id, "lease acquired");
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, RepositoryError> {
        let renewed = lease.renewed(ttl);
        let result = sqlx::query(
            "UPDATE instance_leases SET expires_at = ? WHERE instance_id = ? AND lease_id = ?",
        )
        .bind(format_datetime(&renewed.expires_at))
        .bind(lease.instance_id.to_string())
        .bind(lease.lease_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::LeaseLost(lease.instance_id));
        }
        Ok(renewed)
    }

    async fn unlock(&self, lease: &Lease) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM instance_leases WHERE instance_id = ? AND lease_id = ?")
            .bind(lease.instance_id.to_string())
            .bind(lease.lease_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO workflow_instances ({INSTANCE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(instance.id.to_string())
        .bind(instance.definition_id.to_string())
        .bind(&instance.definition_code)
        .bind(instance.definition_version as i64)
        .bind(&instance.tenant_id)
        .bind(enum_str(&instance.status)?)
        .bind(&instance.entity.entity_type)
        .bind(&instance.entity.entity_id)
        .bind(to_json(&instance.context)?)
        .bind(&instance.current_step)
        .bind(format_datetime(&instance.started_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(instance.failed_at.as_ref().map(format_datetime))
        .bind(instance.cancelled_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.updated_at))
        .bind(&instance.error)
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn load_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(decode_instances(std::slice::from_ref(&row))?.pop()),
            None => Ok(None),
        }
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 status = ?, context = ?, current_step = ?, completed_at = ?,
                 failed_at = ?, cancelled_at = ?, updated_at = ?, error = ?
               WHERE id = ?"#,
        )
        .bind(enum_str(&instance.status)?)
        .bind(to_json(&instance.context)?)
        .bind(&instance.current_step)
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(instance.failed_at.as_ref().map(format_datetime))
        .bind(instance.cancelled_at.as_ref().map(format_datetime))
        .bind(format_datetime(&instance.updated_at))
        .bind(&instance.error)
        .bind(instance.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE status = ? \
                     ORDER BY started_at DESC LIMIT ?"
                ))
                .bind(enum_str(&status)?)
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
                     ORDER BY started_at DESC LIMIT ?"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_instances(&rows)
    }

    async fn save_step(&self, step: &InstanceStep) -> Result<(), RepositoryError> {
        let output = step.output.as_ref().map(to_json).transpose()?;

        sqlx::query(&format!(
            "INSERT INTO instance_steps ({STEP_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               status = excluded.status, \
               input = excluded.input, \
               output = excluded.output, \
               error = excluded.error, \
               started_at = excluded.started_at, \
               completed_at = excluded.completed_at, \
               deadline_at = excluded.deadline_at, \
               scheduled_at = excluded.scheduled_at"
        ))
        .bind(step.id.to_string())
        .bind(step.instance_id.to_string())
        .bind(&step.step_id)
        .bind(enum_str(&step.step_type)?)
        .bind(enum_str(&step.status)?)
        .bind(step.attempt as i64)
        .bind(to_json(&step.input)?)
        .bind(&output)
        .bind(&step.error)
        .bind(format_datetime(&step.created_at))
        .bind(step.started_at.as_ref().map(format_datetime))
        .bind(step.completed_at.as_ref().map(format_datetime))
        .bind(step.deadline_at.as_ref().map(format_datetime))
        .bind(step.scheduled_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn load_step(&self, id: &Uuid) -> Result<Option<InstanceStep>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM instance_steps WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(decode_steps(std::slice::from_ref(&row))?.pop()),
            None => Ok(None),
        }
    }

    async fn latest_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<InstanceStep>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM instance_steps WHERE instance_id = ? AND step_id = ? \
             ORDER BY created_at DESC, attempt DESC LIMIT 1"
        ))
        .bind(instance_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(decode_steps(std::slice::from_ref(&row))?.pop()),
            None => Ok(None),
        }
    }

    async fn list_steps(&self, instance_id: &Uuid) -> Result<Vec<InstanceStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM instance_steps WHERE instance_id = ? \
             ORDER BY created_at ASC, attempt ASC"
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_steps(&rows)
    }

    async fn list_overdue_steps(&self, now: DateTime<Utc>) -> Result<Vec<InstanceStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM instance_steps \
             WHERE status = 'running' AND deadline_at IS NOT NULL AND deadline_at <= ? \
             ORDER BY deadline_at ASC"
        ))
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_steps(&rows)
    }

    async fn list_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<InstanceStep>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM instance_steps \
             WHERE status = 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= ? \
             ORDER BY scheduled_at ASC"
        ))
        .bind(format_datetime(&now))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_steps(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use stepwise_core::repository::definition::DefinitionStore;
    use stepwise_types::instance::StepStatus;
    use stepwise_types::workflow::{StepType, WorkflowDefinition};

    use crate::sqlite::definition::SqliteDefinitionStore;

    async fn test_pool() -> (DatabasePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        (DatabasePool::new(&url).await.unwrap(), dir)
    }

    /// Instances reference a stored definition, so seed one first.
    async fn seeded_instance(pool: &DatabasePool) -> WorkflowInstance {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "code": "expense",
            "name": "Expense claim",
            "steps": [{
                "id": "check",
                "name": "Check receipt",
                "sequence": 1,
                "config": { "type": "action", "handler": "echo" }
            }]
        }))
        .unwrap();
        let def = SqliteDefinitionStore::new(pool.clone()).activate(def).await.unwrap();

        let now = Utc::now();
        let mut context = Map::new();
        context.insert("amount".to_string(), json!(42));
        WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_code: def.code.clone(),
            definition_version: def.version,
            tenant_id: String::new(),
            status: InstanceStatus::Running,
            entity: EntityRef {
                entity_type: "expense".to_string(),
                entity_id: "EXP-9".to_string(),
            },
            context,
            current_step: Some("check".to_string()),
            started_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            updated_at: now,
            error: None,
        }
    }

    #[tokio::test]
    async fn instance_round_trip_and_update() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteInstanceRepository::new(pool.clone());
        let mut instance = seeded_instance(&pool).await;
        repo.create_instance(&instance).await.unwrap();

        let loaded = repo.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.context["amount"], 42);
        assert_eq!(loaded.entity.to_string(), "expense:EXP-9");
        assert_eq!(loaded.started_at, instance.started_at);

        instance.mark_completed(Utc::now());
        repo.save_instance(&instance).await.unwrap();
        let loaded = repo.load_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Completed);
        assert!(loaded.current_step.is_none());

        let completed = repo
            .list_instances(Some(InstanceStatus::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert!(repo
            .list_instances(Some(InstanceStatus::Running), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_instance_is_a_conflict() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteInstanceRepository::new(pool.clone());
        let instance = seeded_instance(&pool).await;
        repo.create_instance(&instance).await.unwrap();

        let err = repo.create_instance(&instance).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteInstanceRepository::new(pool);
        let id = Uuid::now_v7();

        let lease = repo.lock(&id, Duration::from_secs(60)).await.unwrap();
        let second = repo.lock(&id, Duration::from_secs(60)).await;
        assert!(matches!(second, Err(RepositoryError::LockHeld(held)) if held == id));

        repo.unlock(&lease).await.unwrap();
        assert!(repo.lock(&id, Duration::from_secs(60)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteInstanceRepository::new(pool);
        let id = Uuid::now_v7();

        let stale = repo.lock(&id, Duration::ZERO).await.unwrap();
        let fresh = repo.lock(&id, Duration::from_secs(60)).await.unwrap();
        assert_ne!(stale.lease_id, fresh.lease_id);

        // The stale holder's release leaves the new lease in place.
        repo.unlock(&stale).await.unwrap();
        assert!(matches!(
            repo.lock(&id, Duration::from_secs(60)).await,
            Err(RepositoryError::LockHeld(_))
        ));
    }

    #[tokio::test]
    async fn renew_fails_after_takeover() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteInstanceRepository::new(pool);
        let id = Uuid::now_v7();

        let held = repo.lock(&id, Duration::from_secs(1)).await.unwrap();
        let renewed = repo.renew(&held, Duration::from_secs(60)).await.unwrap();
        assert_eq!(renewed.lease_id, held.lease_id);
        assert!(renewed.expires_at > held.expires_at);
        repo.unlock(&renewed).await.unwrap();

        let stale = repo.lock(&id, Duration::ZERO).await.unwrap();
        repo.lock(&id, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(
            repo.renew(&stale, Duration::from_secs(60)).await,
            Err(RepositoryError::LeaseLost(lost)) if lost == id
        ));
    }

    #[tokio::test]
    async fn step_history_and_sweep_queries() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteInstanceRepository::new(pool.clone());
        let instance = seeded_instance(&pool).await;
        repo.create_instance(&instance).await.unwrap();

        let now = Utc::now();
        let mut first = InstanceStep::pending(instance.id, "check", StepType::Action, 1, now);
        first.status = StepStatus::Running;
        first.started_at = Some(now);
        first.deadline_at = Some(now + chrono::Duration::seconds(30));
        repo.save_step(&first).await.unwrap();

        assert!(repo.list_overdue_steps(now).await.unwrap().is_empty());
        let overdue = repo
            .list_overdue_steps(now + chrono::Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, first.id);

        first.mark_failed("boom", now);
        repo.save_step(&first).await.unwrap();

        let later = now + chrono::Duration::milliseconds(1);
        let mut retry = InstanceStep::pending(instance.id, "check", StepType::Action, 2, later);
        retry.scheduled_at = Some(now + chrono::Duration::seconds(5));
        repo.save_step(&retry).await.unwrap();

        let latest = repo.latest_step(&instance.id, "check").await.unwrap().unwrap();
        assert_eq!(latest.id, retry.id);
        assert_eq!(latest.attempt, 2);

        assert!(repo.list_due_retries(now).await.unwrap().is_empty());
        let due = repo
            .list_due_retries(now + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);

        let history = repo.list_steps(&instance.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, StepStatus::Failed);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
    }
}
