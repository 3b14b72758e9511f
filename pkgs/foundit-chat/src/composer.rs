//! Message composer - inserts messages and performs the bookkeeping that follows a send
//!
//! A send is committed once the insert returns; the returned row is authoritative and is
//! spliced into local state as is. Everything after it (last-read, conversation preview,
//! notification) is best-effort and never undoes the send.

use chrono::{DateTime, Utc};
use foundit_store::{ChatStore, MessageKind, MessageRow, NewMessage, StoreError};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::attachments::AttachmentPipeline;
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::notify::{Notifier, SendNotification};

const IMAGE_PREVIEW: &str = "📷 Photo";
const FILE_PREVIEW: &str = "📎 File";

pub struct MessageComposer {
    me: String,
    store: Arc<dyn ChatStore>,
    attachments: AttachmentPipeline,
    notifier: Arc<dyn Notifier>,
    config: ChatConfig,
}

impl MessageComposer {
    pub fn new(
        me: impl Into<String>,
        store: Arc<dyn ChatStore>,
        attachments: AttachmentPipeline,
        notifier: Arc<dyn Notifier>,
        config: ChatConfig,
    ) -> Self {
        Self {
            me: me.into(),
            store,
            attachments,
            notifier,
            config,
        }
    }

    /// Insert a text message; empty or whitespace-only text never reaches the store
    #[instrument(skip(self, text))]
    pub async fn post_text(&self, conversation_id: &str, text: &str) -> ChatResult<MessageRow> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation("Message cannot be empty".to_string()));
        }

        let row = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                sender_id: self.me.clone(),
                kind: MessageKind::Text,
                content: text.to_string(),
                metadata: None,
            })
            .await?;

        debug!("Sent text message {} to {}", row.id, conversation_id);
        Ok(row)
    }

    /// Upload an image and, only once its URL resolves, insert the message referencing it
    #[instrument(skip(self))]
    pub async fn post_image(&self, conversation_id: &str, local: &Path) -> ChatResult<MessageRow> {
        let attachment = self.attachments.upload(conversation_id, local).await?;
        let metadata = serde_json::to_value(&attachment).map_err(StoreError::from)?;

        let row = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                sender_id: self.me.clone(),
                kind: MessageKind::Image,
                content: String::new(),
                metadata: Some(metadata),
            })
            .await?;

        info!("Sent image message {} to {}", row.id, conversation_id);
        Ok(row)
    }

    /// Bookkeeping after a committed send
    ///
    /// Returns the last-read marker recorded for the sender, if that write succeeded.
    pub async fn settle(&self, message: &MessageRow) -> Option<DateTime<Utc>> {
        let read_at = Utc::now().max(message.created_at);
        let recorded = match self
            .store
            .set_last_read(&message.conversation_id, &self.me, read_at)
            .await
        {
            Ok(()) => Some(read_at),
            Err(e) => {
                warn!(
                    "Failed to update last read of {} after send: {}",
                    message.conversation_id, e
                );
                None
            }
        };

        let preview = self.preview(message);
        if let Err(e) = self
            .store
            .update_conversation_summary(
                &message.conversation_id,
                &preview,
                &self.me,
                message.created_at,
            )
            .await
        {
            warn!(
                "Failed to update preview of {} after send: {}",
                message.conversation_id, e
            );
        }

        self.dispatch_notification(message, preview);
        recorded
    }

    /// Conversation preview text for a message
    pub fn preview(&self, message: &MessageRow) -> String {
        match message.kind {
            MessageKind::Text => truncate_preview(&message.content, self.config.preview_max_chars),
            MessageKind::Image => IMAGE_PREVIEW.to_string(),
            MessageKind::File => FILE_PREVIEW.to_string(),
        }
    }

    fn dispatch_notification(&self, message: &MessageRow, preview: String) {
        let store = self.store.clone();
        let notifier = self.notifier.clone();
        let sender_id = self.me.clone();
        let conversation_id = message.conversation_id.clone();
        let message_id = message.id.clone();

        tokio::spawn(async move {
            let recipients: Vec<String> =
                match store.participants_in(&[conversation_id.clone()]).await {
                    Ok(participants) => participants
                        .into_iter()
                        .map(|p| p.user_id)
                        .filter(|user_id| *user_id != sender_id)
                        .collect(),
                    Err(e) => {
                        warn!("Could not resolve recipients for {}: {}", message_id, e);
                        return;
                    }
                };
            if recipients.is_empty() {
                return;
            }

            let notification = SendNotification {
                conversation_id,
                message_id,
                sender_id,
                recipients,
                preview,
            };
            if let Err(e) = notifier.notify(notification).await {
                warn!("Notification dispatch failed: {}", e);
            }
        });
    }
}

/// Cut `text` to `max_chars` characters, marking the cut with an ellipsis
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
