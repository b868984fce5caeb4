//! Broadcast event bus for distributing `WorkflowEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.

use stepwise_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Fire-and-forget destination for lifecycle events.
///
/// Called after the instance lock is released. Implementations must not
/// block; consumers deduplicate on `WorkflowEvent::dedup_key`.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: WorkflowEvent);
}

/// Multi-consumer event bus for workflow lifecycle events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for EventBus {
    /// If there are no subscribers, the event is silently dropped.
    fn publish(&self, event: WorkflowEvent) {
        tracing::trace!(event_type = event.event_type(), instance_id = %event.instance_id(), "publishing event");
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
