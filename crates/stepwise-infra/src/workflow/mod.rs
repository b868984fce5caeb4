//! Engine collaborators backed by configuration and the outside world.
//!
//! - `resolver` -- approver resolution through `[roles]` in config
//! - `handlers` -- built-in `http` and `echo` action handlers
//! - `notifier` -- notification dispatcher that writes to the tracing log

pub mod handlers;
pub mod notifier;
pub mod resolver;

use stepwise_core::workflow::handler::ActionHandlerRegistry;

pub use handlers::{EchoHandler, HttpHandler};
pub use notifier::TracingNotifier;
pub use resolver::ConfigActorResolver;

/// Registry with every built-in handler registered.
pub fn builtin_handlers() -> Result<ActionHandlerRegistry, reqwest::Error> {
    Ok(ActionHandlerRegistry::new()
        .with(HttpHandler::new()?)
        .with(EchoHandler))
}
