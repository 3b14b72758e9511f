//! Notification dispatch after successful sends

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// What the other participants are told about a new message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendNotification {
    pub conversation_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub recipients: Vec<String>,
    pub preview: String,
}

/// Push delivery capability. Calls are fire-and-forget; failures are logged, never surfaced.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: SendNotification) -> anyhow::Result<()>;
}

/// Notifier that only logs, for hosts without push delivery
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: SendNotification) -> anyhow::Result<()> {
        info!(
            conversation_id = %notification.conversation_id,
            message_id = %notification.message_id,
            recipients = notification.recipients.len(),
            "Notify: {}",
            notification.preview
        );
        Ok(())
    }
}
