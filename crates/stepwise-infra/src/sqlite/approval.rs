//! SQLite approval repository.
//!
//! A partial unique index keeps at most one pending approval per
//! (instance, step); inserting a second surfaces as `RepositoryError::Conflict`.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::repository::approval::ApprovalRepository;
use stepwise_types::approval::Approval;
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::row::{
    enum_str, format_datetime, parse_datetime, parse_enum, parse_json, parse_opt_datetime,
    parse_uuid, to_json, write_error,
};

/// SQLite-backed implementation of `ApprovalRepository`.
#[derive(Clone)]
pub struct SqliteApprovalRepository {
    pool: DatabasePool,
}

impl SqliteApprovalRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn fetch_all(
        &self,
        sql: &str,
        binds: &[String],
    ) -> Result<Vec<Approval>, RepositoryError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        decode_rows(&rows)
    }

    async fn fetch_one(
        &self,
        sql: &str,
        binds: &[String],
    ) -> Result<Option<Approval>, RepositoryError> {
        Ok(self.fetch_all(sql, binds).await?.into_iter().next())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ApprovalRow {
    id: String,
    instance_id: String,
    step_id: String,
    instance_step_id: String,
    assigned_to: String,
    delegate: Option<String>,
    status: String,
    priority: String,
    due_at: String,
    escalation_level: i64,
    decision: Option<String>,
    decided_by: Option<String>,
    comment: Option<String>,
    responded_at: Option<String>,
    created_at: String,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            step_id: row.try_get("step_id")?,
            instance_step_id: row.try_get("instance_step_id")?,
            assigned_to: row.try_get("assigned_to")?,
            delegate: row.try_get("delegate")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            due_at: row.try_get("due_at")?,
            escalation_level: row.try_get("escalation_level")?,
            decision: row.try_get("decision")?,
            decided_by: row.try_get("decided_by")?,
            comment: row.try_get("comment")?,
            responded_at: row.try_get("responded_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_approval(self) -> Result<Approval, RepositoryError> {
        let decision = self
            .decision
            .as_deref()
            .map(|s| parse_json(s, "approval decision"))
            .transpose()?;

        Ok(Approval {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            step_id: self.step_id,
            instance_step_id: parse_uuid(&self.instance_step_id)?,
            assigned_to: self.assigned_to,
            delegate: self.delegate,
            status: parse_enum(&self.status, "approval status")?,
            priority: parse_enum(&self.priority, "approval priority")?,
            due_at: parse_datetime(&self.due_at)?,
            escalation_level: self.escalation_level as u32,
            decision,
            decided_by: self.decided_by,
            comment: self.comment,
            responded_at: parse_opt_datetime(self.responded_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn decode_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Approval>, RepositoryError> {
    rows.iter()
        .map(|row| {
            ApprovalRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_approval()
        })
        .collect()
}

const APPROVAL_COLUMNS: &str = "id, instance_id, step_id, instance_step_id, assigned_to, delegate, \
    status, priority, due_at, escalation_level, decision, decided_by, comment, responded_at, created_at";

// ---------------------------------------------------------------------------
// ApprovalRepository impl
// ---------------------------------------------------------------------------

impl ApprovalRepository for SqliteApprovalRepository {
    async fn create_approval(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let decision = approval.decision.as_ref().map(to_json).transpose()?;

        sqlx::query(&format!(
            "INSERT INTO approvals ({APPROVAL_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(approval.id.to_string())
        .bind(approval.instance_id.to_string())
        .bind(&approval.step_id)
        .bind(approval.instance_step_id.to_string())
        .bind(&approval.assigned_to)
        .bind(&approval.delegate)
        .bind(enum_str(&approval.status)?)
        .bind(enum_str(&approval.priority)?)
        .bind(format_datetime(&approval.due_at))
        .bind(approval.escalation_level as i64)
        .bind(&decision)
        .bind(&approval.decided_by)
        .bind(&approval.comment)
        .bind(approval.responded_at.as_ref().map(format_datetime))
        .bind(format_datetime(&approval.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn save_approval(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let decision = approval.decision.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE approvals SET
                 assigned_to = ?, delegate = ?, status = ?, priority = ?, due_at = ?,
                 escalation_level = ?, decision = ?, decided_by = ?, comment = ?, responded_at = ?
               WHERE id = ?"#,
        )
        .bind(&approval.assigned_to)
        .bind(&approval.delegate)
        .bind(enum_str(&approval.status)?)
        .bind(enum_str(&approval.priority)?)
        .bind(format_datetime(&approval.due_at))
        .bind(approval.escalation_level as i64)
        .bind(&decision)
        .bind(&approval.decided_by)
        .bind(&approval.comment)
        .bind(approval.responded_at.as_ref().map(format_datetime))
        .bind(approval.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_approval(&self, id: &Uuid) -> Result<Option<Approval>, RepositoryError> {
        self.fetch_one(
            &format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?"),
            &[id.to_string()],
        )
        .await
    }

    async fn latest_for_attempt(
        &self,
        instance_step_id: &Uuid,
    ) -> Result<Option<Approval>, RepositoryError> {
        self.fetch_one(
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE instance_step_id = ? \
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ),
            &[instance_step_id.to_string()],
        )
        .await
    }

    async fn pending_for_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<Approval>, RepositoryError> {
        self.fetch_one(
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approvals \
                 WHERE instance_id = ? AND step_id = ? AND status = 'pending'"
            ),
            &[instance_id.to_string(), step_id.to_string()],
        )
        .await
    }

    async fn list_pending(&self, assignee: Option<&str>) -> Result<Vec<Approval>, RepositoryError> {
        match assignee {
            Some(who) => {
                self.fetch_all(
                    &format!(
                        "SELECT {APPROVAL_COLUMNS} FROM approvals \
                         WHERE status = 'pending' AND assigned_to = ? ORDER BY due_at ASC"
                    ),
                    &[who.to_string()],
                )
                .await
            }
            None => {
                self.fetch_all(
                    &format!(
                        "SELECT {APPROVAL_COLUMNS} FROM approvals \
                         WHERE status = 'pending' ORDER BY due_at ASC"
                    ),
                    &[],
                )
                .await
            }
        }
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        self.fetch_all(
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approvals \
                 WHERE status = 'pending' AND due_at < ? ORDER BY due_at ASC"
            ),
            &[format_datetime(&now)],
        )
        .await
    }

    async fn list_for_instance(&self, instance_id: &Uuid) -> Result<Vec<Approval>, RepositoryError> {
        self.fetch_all(
            &format!(
                "SELECT {APPROVAL_COLUMNS} FROM approvals WHERE instance_id = ? \
                 ORDER BY created_at ASC, id ASC"
            ),
            &[instance_id.to_string()],
        )
        .await
    }
}
