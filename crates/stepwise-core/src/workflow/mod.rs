//! Workflow engine core: condition routing, step execution and the instance
//! state machine.
//!
//! - `definition` -- YAML parsing and structural validation
//! - `context` -- Context lookups, output merging and template resolution
//! - `condition` -- Branch selection over the instance context
//! - `retry` -- Exponential backoff retry policy
//! - `handler` -- Action handler trait and registry
//! - `actor` / `notify` -- Approver resolution and notification ports
//! - `approval` -- Approval task lifecycle
//! - `step_executor` -- Per-attempt dispatch for the four step types
//! - `orchestrator` -- Locked, one-transition-at-a-time instance advancement
//! - `sweeper` -- Periodic deadline and escalation scan
//! - `worker` -- Queue-driven worker pool

pub mod actor;
pub mod approval;
pub mod condition;
pub mod context;
pub mod definition;
pub mod handler;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod step_executor;
pub mod sweeper;
pub mod worker;
