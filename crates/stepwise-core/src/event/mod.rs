//! Event publication for workflow lifecycle transitions.
//!
//! The orchestrator publishes through the `EventSink` trait; `EventBus`
//! is the default sink and distributes `WorkflowEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::{EventBus, EventSink};
