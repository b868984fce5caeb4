//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology; `memory::InMemoryStore` implements every
//! trait for single-process use and tests.

pub mod approval;
pub mod definition;
pub mod instance;
pub mod memory;

pub use approval::ApprovalRepository;
pub use definition::DefinitionStore;
pub use instance::{InstanceRepository, Lease};
pub use memory::InMemoryStore;
