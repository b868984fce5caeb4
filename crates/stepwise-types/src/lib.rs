//! Shared domain types for Stepwise.
//!
//! This crate contains the data model of the workflow engine: definitions and
//! their typed step configurations, running instances with their per-attempt
//! step records, approval tasks, lifecycle events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod workflow;
