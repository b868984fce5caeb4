//! Notification dispatch port.

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub instance_id: Uuid,
    pub step_id: String,
    pub channel: String,
    pub recipients: Vec<String>,
    /// Template with context placeholders already resolved.
    pub message: String,
}

/// Delivers notifications. Fire-and-forget from the engine's perspective:
/// a successful dispatch completes the step, delivery is not awaited.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
}
