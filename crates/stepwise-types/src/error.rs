use thiserror::Error;

/// Errors from repository operations (used by trait definitions in stepwise-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// Another holder owns a live lease on the instance.
    #[error("instance {0} is locked by another worker")]
    LockHeld(uuid::Uuid),

    /// The caller's lease expired and was taken over, or was released.
    #[error("lease on instance {0} is no longer held")]
    LeaseLost(uuid::Uuid),
}
