//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod approval;
pub mod definition;
pub mod instance;
pub mod pool;
mod row;

pub use approval::SqliteApprovalRepository;
pub use definition::SqliteDefinitionStore;
pub use instance::SqliteInstanceRepository;
pub use pool::DatabasePool;
