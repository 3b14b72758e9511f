//! Reaction store - one emoji per (message, reactor)

use chrono::Utc;
use sea_orm::prelude::Expr;
use sea_orm::*;
use tracing::debug;

use crate::entities::reactions;
use crate::error::{StoreError, StoreResult};

/// Reaction store
pub struct ReactionStore {
    db: DatabaseConnection,
}

impl ReactionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Batch fetch reactions for a set of messages
    pub async fn for_messages(&self, message_ids: &[String]) -> Result<Vec<reactions::Model>, DbErr> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        reactions::Entity::find()
            .filter(reactions::Column::MessageId.is_in(message_ids.to_vec()))
            .all(&self.db)
            .await
    }

    async fn get(&self, message_id: &str, user_id: &str) -> Result<Option<reactions::Model>, DbErr> {
        reactions::Entity::find_by_id((message_id.to_string(), user_id.to_string()))
            .one(&self.db)
            .await
    }

    /// Insert a reaction; a second reaction by the same user on the same message is a `Conflict`
    pub async fn insert(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<reactions::Model> {
        let now = Utc::now().timestamp_millis();
        let model = reactions::Model {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
            created_at: now,
            updated_at: now,
        };

        reactions::Entity::insert(reactions::ActiveModel::from(model.clone()))
            .exec_without_returning(&self.db)
            .await
            .map_err(|e| {
                StoreError::from_insert(e, format!("reaction {}/{}", message_id, user_id))
            })?;

        debug!("{} reacted {} to {}", user_id, emoji, message_id);
        Ok(model)
    }

    /// Replace the emoji of an existing reaction
    pub async fn update(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<(reactions::Model, reactions::Model)>, DbErr> {
        let Some(old) = self.get(message_id, user_id).await? else {
            return Ok(None);
        };

        let now = Utc::now().timestamp_millis();
        reactions::Entity::update_many()
            .col_expr(reactions::Column::Emoji, Expr::value(emoji))
            .col_expr(reactions::Column::UpdatedAt, Expr::value(now))
            .filter(reactions::Column::MessageId.eq(message_id))
            .filter(reactions::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;

        let new = reactions::Model {
            emoji: emoji.to_string(),
            updated_at: now,
            ..old.clone()
        };
        debug!("{} changed reaction on {} to {}", user_id, message_id, emoji);
        Ok(Some((old, new)))
    }

    /// Remove a user's reaction from a message
    pub async fn delete(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Option<reactions::Model>, DbErr> {
        let Some(old) = self.get(message_id, user_id).await? else {
            return Ok(None);
        };

        reactions::Entity::delete_many()
            .filter(reactions::Column::MessageId.eq(message_id))
            .filter(reactions::Column::UserId.eq(user_id))
            .exec(&self.db)
            .await?;

        debug!("{} removed reaction from {}", user_id, message_id);
        Ok(Some(old))
    }
}
