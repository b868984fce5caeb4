//! Observability setup for Stepwise binaries.

pub mod tracing_setup;
