//! Column encoding shared by the SQLite repositories.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(crate) fn parse_opt_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

/// Fixed-width RFC 3339 so that `<` on the column orders chronologically.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Encode a unit enum as its serde string form (e.g. `Pending` -> "pending").
pub(crate) fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!(
            "expected string-encoded enum, got {other}"
        ))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

pub(crate) fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

pub(crate) fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

/// Map a sqlx error, turning unique-constraint violations into `Conflict`.
pub(crate) fn write_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}
