//! SQLite definition store.
//!
//! Each stored version is one row. The full definition lives in a JSON blob;
//! `status` and `version` are also kept as columns so activation can archive
//! and number versions without rewriting blobs, and the columns win on read.

use stepwise_core::repository::definition::DefinitionStore;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{DefinitionStatus, WorkflowDefinition};
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::row::{enum_str, format_datetime, parse_enum, parse_json, to_json, write_error};

/// SQLite-backed implementation of `DefinitionStore`.
#[derive(Clone)]
pub struct SqliteDefinitionStore {
    pool: DatabasePool,
}

impl SqliteDefinitionStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    status: String,
    version: i64,
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            status: row.try_get("status")?,
            version: row.try_get("version")?,
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = parse_json(&self.definition, "workflow definition")?;
        def.status = parse_enum::<DefinitionStatus>(&self.status, "definition status")?;
        def.version = self.version as u32;
        Ok(def)
    }
}

const SELECT_DEFINITION: &str = "SELECT status, version, definition FROM workflow_definitions";

fn decode_rows(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    rows.iter()
        .map(|row| {
            DefinitionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_definition()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// DefinitionStore impl
// ---------------------------------------------------------------------------

impl DefinitionStore for SqliteDefinitionStore {
    async fn get_active_definition(
        &self,
        code: &str,
        tenant: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_DEFINITION} WHERE tenant_id = ? AND code = ? AND status = 'active'"
        ))
        .bind(tenant)
        .bind(code)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(decode_rows(std::slice::from_ref(&row))?.pop()),
            None => Ok(None),
        }
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_DEFINITION} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(decode_rows(std::slice::from_ref(&row))?.pop()),
            None => Ok(None),
        }
    }

    async fn activate(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let (max_version,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(version) FROM workflow_definitions WHERE tenant_id = ? AND code = ?",
        )
        .bind(&def.tenant_id)
        .bind(&def.code)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let (taken,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_definitions WHERE id = ?")
                .bind(def.id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if taken > 0 {
            def.id = Uuid::now_v7();
        }

        sqlx::query(
            "UPDATE workflow_definitions SET status = 'archived' WHERE tenant_id = ? AND code = ? AND status = 'active'",
        )
        .bind(&def.tenant_id)
        .bind(&def.code)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        def.version = max_version.unwrap_or(0) as u32 + 1;
        def.status = DefinitionStatus::Active;

        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, tenant_id, code, name, status, version, definition, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(&def.tenant_id)
        .bind(&def.code)
        .bind(&def.name)
        .bind(enum_str(&def.status)?)
        .bind(def.version as i64)
        .bind(to_json(&def)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::info!(
            definition_id = %def.id,
            code = def.code.as_str(),
            version = def.version,
            "workflow definition activated"
        );
        Ok(def)
    }

    async fn list_definitions(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = match tenant {
            Some(tenant) => {
                sqlx::query(&format!(
                    "{SELECT_DEFINITION} WHERE tenant_id = ? ORDER BY code ASC, version DESC"
                ))
                .bind(tenant)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!("{SELECT_DEFINITION} ORDER BY code ASC, version DESC"))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows)
    }
}
