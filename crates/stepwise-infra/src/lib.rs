//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the ports defined in `stepwise-core`:
//! SQLite storage with cross-process instance leases, the TOML config
//! loader, data directory layout, and the built-in engine collaborators
//! (config-driven approver resolution, HTTP/echo action handlers, tracing
//! notifier).

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod workflow;
