//! Conversation store - conversations and their participant rows

use chrono::{DateTime, Utc};
use sea_orm::prelude::Expr;
use sea_orm::*;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::{conversations, messages, participants, reactions};

/// Conversation store
pub struct ConversationStore {
    pub(crate) db: DatabaseConnection,
}

impl ConversationStore {
    /// Create a conversation store with an existing database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create an empty conversation row
    pub async fn insert(&self) -> Result<conversations::Model, DbErr> {
        let now = Utc::now().timestamp_millis();
        let model = conversations::Model {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_message_at: None,
            last_message: None,
            last_message_sender_id: None,
            updated_at: now,
        };

        conversations::Entity::insert(conversations::ActiveModel::from(model.clone()))
            .exec_without_returning(&self.db)
            .await?;

        info!("Created conversation {}", model.id);
        Ok(model)
    }

    /// Get a single conversation by ID
    pub async fn get(&self, id: &str) -> Result<Option<conversations::Model>, DbErr> {
        conversations::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
    }

    /// Batch fetch conversations in one query
    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<conversations::Model>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        conversations::Entity::find()
            .filter(conversations::Column::Id.is_in(ids.to_vec()))
            .all(&self.db)
            .await
    }

    /// Update the denormalized last-message fields
    pub async fn update_last_message(
        &self,
        id: &str,
        preview: &str,
        sender_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<(conversations::Model, conversations::Model)>, DbErr> {
        let Some(old) = self.get(id).await? else {
            return Ok(None);
        };

        let mut active: conversations::ActiveModel = old.clone().into();
        active.last_message = Set(Some(preview.to_string()));
        active.last_message_at = Set(Some(at.timestamp_millis()));
        active.last_message_sender_id = Set(Some(sender_id.to_string()));
        active.updated_at = Set(Utc::now().timestamp_millis());
        let new = active.update(&self.db).await?;

        debug!("Updated last message of conversation {}", id);
        Ok(Some((old, new)))
    }

    /// Delete a conversation along with its messages, their reactions and its participants
    pub async fn delete_cascade(&self, id: &str) -> Result<Option<conversations::Model>, DbErr> {
        let txn = self.db.begin().await?;

        let Some(old) = conversations::Entity::find_by_id(id.to_string())
            .one(&txn)
            .await?
        else {
            txn.rollback().await?;
            return Ok(None);
        };

        let message_ids: Vec<String> = messages::Entity::find()
            .select_only()
            .column(messages::Column::Id)
            .filter(messages::Column::ConversationId.eq(id))
            .into_tuple()
            .all(&txn)
            .await?;

        if !message_ids.is_empty() {
            reactions::Entity::delete_many()
                .filter(reactions::Column::MessageId.is_in(message_ids))
                .exec(&txn)
                .await?;
        }
        messages::Entity::delete_many()
            .filter(messages::Column::ConversationId.eq(id))
            .exec(&txn)
            .await?;
        participants::Entity::delete_many()
            .filter(participants::Column::ConversationId.eq(id))
            .exec(&txn)
            .await?;
        conversations::Entity::delete_by_id(id.to_string())
            .exec(&txn)
            .await?;

        txn.commit().await?;
        info!("Deleted conversation {}", id);
        Ok(Some(old))
    }

    /// All membership rows of a user
    pub async fn memberships(&self, user_id: &str) -> Result<Vec<participants::Model>, DbErr> {
        participants::Entity::find()
            .filter(participants::Column::UserId.eq(user_id))
            .all(&self.db)
            .await
    }

    /// Batch fetch every participant of the given conversations in one query
    pub async fn participants_in(
        &self,
        conversation_ids: &[String],
    ) -> Result<Vec<participants::Model>, DbErr> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        participants::Entity::find()
            .filter(participants::Column::ConversationId.is_in(conversation_ids.to_vec()))
            .order_by_asc(participants::Column::ConversationId)
            .order_by_asc(participants::Column::UserId)
            .all(&self.db)
            .await
    }

    /// Insert one participant row per user
    pub async fn add_participants(
        &self,
        conversation_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<participants::Model>, DbErr> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let models: Vec<participants::Model> = user_ids
            .iter()
            .map(|user_id| participants::Model {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.clone(),
                last_read_at: None,
                joined_at: now,
            })
            .collect();

        participants::Entity::insert_many(
            models
                .iter()
                .cloned()
                .map(participants::ActiveModel::from),
        )
        .exec_without_returning(&self.db)
        .await?;

        debug!(
            "Added {} participants to conversation {}",
            models.len(),
            conversation_id
        );
        Ok(models)
    }

    /// Set a participant's last-read marker
    pub async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<(participants::Model, participants::Model)>, DbErr> {
        let key = (conversation_id.to_string(), user_id.to_string());
        let Some(old) = participants::Entity::find_by_id(key.clone())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        participants::Entity::update_many()
            .col_expr(
                participants::Column::LastReadAt,
                Expr::value(Some(at.timestamp_millis())),
            )
            .filter(participants::Column::ConversationId.eq(conversation_id))
            .filter(participants::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;

        let new = participants::Model {
            last_read_at: Some(at.timestamp_millis()),
            ..old.clone()
        };
        debug!(
            "Marked conversation {} read by {} at {}",
            conversation_id, user_id, at
        );
        Ok(Some((old, new)))
    }
}
