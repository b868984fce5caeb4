//! Workflow engine logic and port definitions for Stepwise.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, and the engine built on them. It
//! depends only on `stepwise-types` -- never on `stepwise-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
