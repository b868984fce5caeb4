//! Action handlers and their registry.
//!
//! Follows the same blanket-impl pattern as the other object-safe ports:
//! 1. `ActionHandler` uses native async fn in traits for implementors
//! 2. `ActionHandlerDyn` is the object-safe mirror with boxed futures,
//!    blanket-implemented for every `ActionHandler`
//! 3. `ActionHandlerRegistry` stores `Arc<dyn ActionHandlerDyn>` by name

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use stepwise_types::workflow::ActionConfig;
use thiserror::Error;

use super::step_executor::StepError;

/// Failure reported by an action handler.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Transient or remote failure; the step may be retried.
    #[error("{0}")]
    Failed(String),

    /// The step's parameters are unusable; retrying cannot help.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// An external action invoked by action steps.
pub trait ActionHandler: Send + Sync + 'static {
    /// Name steps reference in `handler:`.
    fn name(&self) -> &str;

    /// Run the action. The returned value becomes the step output.
    fn invoke(
        &self,
        params: &Value,
        context: &Map<String, Value>,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send;
}

/// Object-safe version of [`ActionHandler`] with boxed futures.
pub trait ActionHandlerDyn: Send + Sync {
    fn name(&self) -> &str;

    fn invoke_boxed<'a>(
        &'a self,
        params: &'a Value,
        context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>>;
}

/// Blanket implementation: any `ActionHandler` automatically implements `ActionHandlerDyn`.
impl<T: ActionHandler> ActionHandlerDyn for T {
    fn name(&self) -> &str {
        ActionHandler::name(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        params: &'a Value,
        context: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>> {
        Box::pin(self.invoke(params, context))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name -> handler lookup used by the step executor.
#[derive(Clone, Default)]
pub struct ActionHandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandlerDyn>>,
}

impl ActionHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register<H: ActionHandler>(&mut self, handler: H) {
        let name = ActionHandler::name(&handler).to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Builder-style `register`.
    pub fn with<H: ActionHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Invoke the handler named by `config` with a bounded timeout.
    ///
    /// The handler runs on its own task so a panic surfaces as a handler
    /// error instead of unwinding through the orchestrator. On timeout the
    /// task is aborted.
    pub async fn invoke(
        &self,
        config: &ActionConfig,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let handler = self
            .handlers
            .get(&config.handler)
            .cloned()
            .ok_or_else(|| StepError::UnknownHandler(config.handler.clone()))?;

        let params = config.params.clone();
        let context = context.clone();
        let mut task =
            tokio::spawn(async move { handler.invoke_boxed(&params, &context).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(ActionError::InvalidParams(message)))) => Err(StepError::InvalidParams {
                handler: config.handler.clone(),
                message,
            }),
            Ok(Ok(Err(ActionError::Failed(message)))) => Err(StepError::HandlerError {
                handler: config.handler.clone(),
                message,
            }),
            Ok(Err(join_err)) => Err(StepError::HandlerError {
                handler: config.handler.clone(),
                message: format!("handler task failed: {join_err}"),
            }),
            Err(_) => {
                task.abort();
                Err(StepError::HandlerTimeout {
                    handler: config.handler.clone(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}

impl std::fmt::Debug for ActionHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Uppercase;

    impl ActionHandler for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }

        async fn invoke(
            &self,
            params: &Value,
            _context: &Map<String, Value>,
        ) -> Result<Value, ActionError> {
            let text = params["text"]
                .as_str()
                .ok_or_else(|| ActionError::InvalidParams("missing 'text'".to_string()))?;
            Ok(json!({ "text": text.to_uppercase() }))
        }
    }

    struct Sleepy;

    impl ActionHandler for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn invoke(
            &self,
            _params: &Value,
            _context: &Map<String, Value>,
        ) -> Result<Value, ActionError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct Panicky;

    impl ActionHandler for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn invoke(
            &self,
            _params: &Value,
            _context: &Map<String, Value>,
        ) -> Result<Value, ActionError> {
            panic!("handler bug");
        }
    }

    fn action(handler: &str, params: Value) -> ActionConfig {
        ActionConfig {
            handler: handler.to_string(),
            params,
        }
    }

    fn registry() -> ActionHandlerRegistry {
        ActionHandlerRegistry::new()
            .with(Uppercase)
            .with(Sleepy)
            .with(Panicky)
    }

    #[tokio::test]
    async fn invokes_registered_handler() {
        let out = registry()
            .invoke(
                &action("uppercase", json!({"text": "ship it"})),
                &Map::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "SHIP IT"}));
    }

    #[tokio::test]
    async fn unknown_handler_is_reported() {
        let err = registry()
            .invoke(&action("fax", json!({})), &Map::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnknownHandler(name) if name == "fax"));
    }

    #[tokio::test]
    async fn invalid_params_are_not_retryable() {
        let err = registry()
            .invoke(&action("uppercase", json!({})), &Map::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidParams { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let err = registry()
            .invoke(&action("sleepy", json!({})), &Map::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::HandlerTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn panicking_handler_becomes_handler_error() {
        let err = registry()
            .invoke(&action("panicky", json!({})), &Map::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::HandlerError { .. }));
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(registry().names(), vec!["panicky", "sleepy", "uppercase"]);
    }
}
