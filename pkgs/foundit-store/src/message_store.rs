//! Message store - persistent storage for messages using Sea-ORM

use chrono::Utc;
use sea_orm::prelude::Expr;
use sea_orm::*;
use tracing::debug;
use uuid::Uuid;

use crate::entities::messages;
use crate::error::StoreResult;
use crate::rows::NewMessage;

/// Message store - manages persistent message storage
pub struct MessageStore {
    pub(crate) db: DatabaseConnection,
}

impl MessageStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a message, assigning id, creation time and sequence
    pub async fn insert(&self, message: NewMessage) -> StoreResult<messages::Model> {
        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let active = messages::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            conversation_id: Set(message.conversation_id),
            sender_id: Set(message.sender_id),
            kind: Set(message.kind.as_str().to_string()),
            content: Set(message.content),
            metadata_json: Set(metadata_json),
            created_at: Set(Utc::now().timestamp_millis()),
            deleted: Set(false),
            ..Default::default()
        };

        let model = active.insert(&self.db).await?;
        debug!(
            "Stored message {} (seq {}) in conversation {}",
            model.id, model.seq, model.conversation_id
        );
        Ok(model)
    }

    /// Get message by ID, including soft-deleted ones
    pub async fn get(&self, message_id: &str) -> Result<Option<messages::Model>, DbErr> {
        messages::Entity::find()
            .filter(messages::Column::Id.eq(message_id))
            .one(&self.db)
            .await
    }

    /// Visible history of a conversation, oldest first
    pub async fn list(&self, conversation_id: &str) -> Result<Vec<messages::Model>, DbErr> {
        let messages = messages::Entity::find()
            .filter(messages::Column::ConversationId.eq(conversation_id))
            .filter(messages::Column::Deleted.eq(false))
            .order_by_asc(messages::Column::CreatedAt)
            .order_by_asc(messages::Column::Seq)
            .all(&self.db)
            .await?;

        debug!(
            "Retrieved {} messages from conversation {}",
            messages.len(),
            conversation_id
        );
        Ok(messages)
    }

    /// Soft-delete a message, scoped to its sender
    ///
    /// Returns the row before and after when something changed. A message that does not
    /// exist and a message owned by someone else both come back as `None`.
    pub async fn soft_delete(
        &self,
        message_id: &str,
        sender_id: &str,
    ) -> Result<Option<(messages::Model, messages::Model)>, DbErr> {
        let result = messages::Entity::update_many()
            .col_expr(messages::Column::Deleted, Expr::value(true))
            .filter(messages::Column::Id.eq(message_id))
            .filter(messages::Column::SenderId.eq(sender_id))
            .filter(messages::Column::Deleted.eq(false))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            debug!(
                "Soft delete of {} by {} changed nothing",
                message_id, sender_id
            );
            return Ok(None);
        }

        Ok(self.get(message_id).await?.map(|new| {
            let old = messages::Model {
                deleted: false,
                ..new.clone()
            };
            (old, new)
        }))
    }
}
