//! Notification dispatcher that writes notifications to the tracing log.
//!
//! Stands in for a real delivery channel: the message has already been
//! rendered against the instance context by the step executor.

use std::future::Future;
use std::pin::Pin;

use stepwise_core::workflow::notify::{Notification, NotificationDispatcher};

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl NotificationDispatcher for TracingNotifier {
    fn dispatch<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                instance_id = %notification.instance_id,
                step_id = notification.step_id.as_str(),
                channel = notification.channel.as_str(),
                recipients = ?notification.recipients,
                message = notification.message.as_str(),
                "notification dispatched"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn dispatch_always_succeeds() {
        let notification = Notification {
            instance_id: Uuid::now_v7(),
            step_id: "notify".to_string(),
            channel: "email".to_string(),
            recipients: vec!["ops@example.com".to_string()],
            message: "Order PO-1 approved".to_string(),
        };
        assert!(TracingNotifier.dispatch(&notification).await.is_ok());
    }
}
