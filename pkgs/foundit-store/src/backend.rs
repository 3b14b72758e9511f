//! The store capability the chat engine is written against, and its SQLite implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use crate::conversation_store::ConversationStore;
use crate::error::StoreResult;
use crate::feed::{ChangeEvent, ChangeFeed, FeedFilter, Row, Subscription};
use crate::message_store::MessageStore;
use crate::profile_manager::ProfileManager;
use crate::reaction_store::ReactionStore;
use crate::rows::{
    ConversationRow, MessageRow, NewMessage, ParticipantRow, ProfileRow, ReactionRow,
};
use crate::StoreConfig;

/// Durable tables plus a change feed
///
/// Batch reads take whole id sets so callers can assemble views in a fixed number of
/// round trips. Writes scoped to an owner (`soft_delete_message`, reaction writes) silently
/// match nothing when the caller is not the owner.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Membership rows of `user_id`
    async fn memberships(&self, user_id: &str) -> StoreResult<Vec<ParticipantRow>>;

    async fn conversations_by_ids(&self, ids: &[String]) -> StoreResult<Vec<ConversationRow>>;

    /// Every participant of every listed conversation
    async fn participants_in(&self, conversation_ids: &[String])
        -> StoreResult<Vec<ParticipantRow>>;

    async fn profiles_by_ids(&self, user_ids: &[String]) -> StoreResult<Vec<ProfileRow>>;

    async fn insert_conversation(&self) -> StoreResult<ConversationRow>;

    async fn insert_participants(
        &self,
        conversation_id: &str,
        user_ids: &[String],
    ) -> StoreResult<Vec<ParticipantRow>>;

    async fn update_conversation_summary(
        &self,
        conversation_id: &str,
        preview: &str,
        sender_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Delete a conversation with its messages, reactions and participants
    async fn delete_conversation(&self, conversation_id: &str) -> StoreResult<()>;

    async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessageRow>;

    /// Non-deleted messages, ordered by creation time then insertion sequence
    async fn messages_in(&self, conversation_id: &str) -> StoreResult<Vec<MessageRow>>;

    /// Returns the number of rows changed (0 for unknown or foreign messages)
    async fn soft_delete_message(&self, message_id: &str, sender_id: &str) -> StoreResult<u64>;

    async fn reactions_for(&self, message_ids: &[String]) -> StoreResult<Vec<ReactionRow>>;

    /// Fails with `StoreError::Conflict` if the user already reacted to the message
    async fn insert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<ReactionRow>;

    async fn update_reaction(&self, message_id: &str, user_id: &str, emoji: &str)
        -> StoreResult<()>;

    async fn delete_reaction(&self, message_id: &str, user_id: &str) -> StoreResult<()>;

    async fn upsert_profile(&self, profile: ProfileRow) -> StoreResult<()>;

    /// Subscribe to row changes matching `filter`
    fn subscribe(&self, filter: FeedFilter) -> Subscription;
}

/// SQLite-backed store
pub struct SqliteStore {
    conversations: ConversationStore,
    messages: MessageStore,
    reactions: ReactionStore,
    profiles: ProfileManager,
    feed: ChangeFeed,
}

impl SqliteStore {
    /// Open (or create) the database and run migrations
    pub async fn new(config: StoreConfig) -> Result<Self> {
        let db_path_str = config
            .db_path
            .to_str()
            .context("Invalid database path")?
            .replace("\\", "/");

        let db_url = format!("sqlite:{}?mode=rwc", db_path_str);

        let db: DatabaseConnection = Database::connect(db_url.as_str())
            .await
            .context("Failed to connect to database")?;

        crate::migration::Migrator::up(&db, None)
            .await
            .context("Failed to run migrations")?;

        info!("Chat store initialized at {}", config.db_path.display());

        Ok(Self::with_connection(db, config.feed_capacity))
    }

    /// Create a store over an existing, already migrated connection
    pub fn with_connection(db: DatabaseConnection, feed_capacity: usize) -> Self {
        Self {
            conversations: ConversationStore::new(db.clone()),
            messages: MessageStore::new(db.clone()),
            reactions: ReactionStore::new(db.clone()),
            profiles: ProfileManager::new(db),
            feed: ChangeFeed::new(feed_capacity),
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn memberships(&self, user_id: &str) -> StoreResult<Vec<ParticipantRow>> {
        let rows = self.conversations.memberships(user_id).await?;
        Ok(rows.into_iter().map(ParticipantRow::from).collect())
    }

    async fn conversations_by_ids(&self, ids: &[String]) -> StoreResult<Vec<ConversationRow>> {
        let rows = self.conversations.get_many(ids).await?;
        Ok(rows.into_iter().map(ConversationRow::from).collect())
    }

    async fn participants_in(
        &self,
        conversation_ids: &[String],
    ) -> StoreResult<Vec<ParticipantRow>> {
        let rows = self.conversations.participants_in(conversation_ids).await?;
        Ok(rows.into_iter().map(ParticipantRow::from).collect())
    }

    async fn profiles_by_ids(&self, user_ids: &[String]) -> StoreResult<Vec<ProfileRow>> {
        let rows = self.profiles.get_many(user_ids).await?;
        Ok(rows.into_iter().map(ProfileRow::from).collect())
    }

    async fn insert_conversation(&self) -> StoreResult<ConversationRow> {
        let row = ConversationRow::from(self.conversations.insert().await?);
        self.feed
            .publish(ChangeEvent::insert(Row::Conversation(row.clone())));
        Ok(row)
    }

    async fn insert_participants(
        &self,
        conversation_id: &str,
        user_ids: &[String],
    ) -> StoreResult<Vec<ParticipantRow>> {
        let rows: Vec<ParticipantRow> = self
            .conversations
            .add_participants(conversation_id, user_ids)
            .await?
            .into_iter()
            .map(ParticipantRow::from)
            .collect();

        for row in &rows {
            self.feed
                .publish(ChangeEvent::insert(Row::Participant(row.clone())));
        }
        Ok(rows)
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: &str,
        preview: &str,
        sender_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some((old, new)) = self
            .conversations
            .update_last_message(conversation_id, preview, sender_id, at)
            .await?
        {
            self.feed.publish(ChangeEvent::update(
                Some(Row::Conversation(old.into())),
                Row::Conversation(new.into()),
            ));
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> StoreResult<()> {
        if let Some(old) = self.conversations.delete_cascade(conversation_id).await? {
            self.feed
                .publish(ChangeEvent::delete(Row::Conversation(old.into())));
        }
        Ok(())
    }

    async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some((old, new)) = self
            .conversations
            .set_last_read(conversation_id, user_id, at)
            .await?
        {
            self.feed.publish(ChangeEvent::update(
                Some(Row::Participant(old.into())),
                Row::Participant(new.into()),
            ));
        }
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessageRow> {
        let row = MessageRow::try_from(self.messages.insert(message).await?)?;
        self.feed
            .publish(ChangeEvent::insert(Row::Message(row.clone())));
        Ok(row)
    }

    async fn messages_in(&self, conversation_id: &str) -> StoreResult<Vec<MessageRow>> {
        self.messages
            .list(conversation_id)
            .await?
            .into_iter()
            .map(MessageRow::try_from)
            .collect()
    }

    async fn soft_delete_message(&self, message_id: &str, sender_id: &str) -> StoreResult<u64> {
        match self.messages.soft_delete(message_id, sender_id).await? {
            Some((old, new)) => {
                self.feed.publish(ChangeEvent::update(
                    Some(Row::Message(MessageRow::try_from(old)?)),
                    Row::Message(MessageRow::try_from(new)?),
                ));
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn reactions_for(&self, message_ids: &[String]) -> StoreResult<Vec<ReactionRow>> {
        let rows = self.reactions.for_messages(message_ids).await?;
        Ok(rows.into_iter().map(ReactionRow::from).collect())
    }

    async fn insert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<ReactionRow> {
        let row = ReactionRow::from(self.reactions.insert(message_id, user_id, emoji).await?);
        self.feed
            .publish(ChangeEvent::insert(Row::Reaction(row.clone())));
        Ok(row)
    }

    async fn update_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<()> {
        if let Some((old, new)) = self.reactions.update(message_id, user_id, emoji).await? {
            self.feed.publish(ChangeEvent::update(
                Some(Row::Reaction(old.into())),
                Row::Reaction(new.into()),
            ));
        }
        Ok(())
    }

    async fn delete_reaction(&self, message_id: &str, user_id: &str) -> StoreResult<()> {
        if let Some(old) = self.reactions.delete(message_id, user_id).await? {
            self.feed
                .publish(ChangeEvent::delete(Row::Reaction(old.into())));
        }
        Ok(())
    }

    async fn upsert_profile(&self, profile: ProfileRow) -> StoreResult<()> {
        let model = self.profiles.upsert(&profile).await?;
        self.feed
            .publish(ChangeEvent::update(None, Row::Profile(model.into())));
        Ok(())
    }

    fn subscribe(&self, filter: FeedFilter) -> Subscription {
        self.feed.subscribe(filter)
    }
}
