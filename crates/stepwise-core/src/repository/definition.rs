//! Definition store trait.
//!
//! Read-only from the engine's perspective: the orchestrator only ever looks
//! definitions up. `activate` and `list_definitions` serve the import path
//! and the CLI.

use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Storage for versioned workflow definitions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionStore: Send + Sync {
    /// The active version of `code` for `tenant`, if any.
    fn get_active_definition(
        &self,
        code: &str,
        tenant: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// A specific stored version by id. Instances resolve their pinned
    /// definition through this, regardless of its current status.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Store `def` as the new active version of its code.
    ///
    /// Archives the previously active version (if any) and assigns
    /// `version = previous max + 1`. Returns the stored definition.
    fn activate(
        &self,
        def: WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, RepositoryError>> + Send;

    /// List definitions, optionally for one tenant, newest version first.
    fn list_definitions(
        &self,
        tenant: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}
