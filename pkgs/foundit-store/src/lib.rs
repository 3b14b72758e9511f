//! Foundit Store - the storage capability behind Foundit chat
//!
//! This crate provides everything the messaging engine treats as "the store":
//!
//! - **SqliteStore**: durable tables over SQLite via Sea-ORM, implementing [`ChatStore`]
//! - **ChangeFeed**: row-level insert/update/delete events with filtered subscriptions
//! - **PresenceHub**: ephemeral per-channel state broadcast (typing indicators)
//! - **LocalObjectStorage**: filesystem object storage implementing [`ObjectStorage`]
//!
//! # Database Schema
//!
//! - `conversations`: conversation rows with denormalized last-message preview
//! - `participants`: (conversation, identity) memberships with last-read markers
//! - `messages`: message rows, ordered by creation time then insertion sequence, soft-deletable
//! - `reactions`: at most one emoji per (message, reactor)
//! - `profiles`: identity display profiles
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use foundit_store::{ChatStore, FeedFilter, MessageKind, NewMessage, SqliteStore, StoreConfig, Table};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::new(StoreConfig {
//!     db_path: "foundit.db".into(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! let mut feed = store.subscribe(FeedFilter::table(Table::Messages));
//!
//! let conversation = store.insert_conversation().await?;
//! store
//!     .insert_participants(&conversation.id, &["alice".into(), "bob".into()])
//!     .await?;
//! store
//!     .insert_message(NewMessage {
//!         conversation_id: conversation.id.clone(),
//!         sender_id: "alice".into(),
//!         kind: MessageKind::Text,
//!         content: "Found your keys!".into(),
//!         metadata: None,
//!     })
//!     .await?;
//!
//! let event = feed.recv().await?;
//! println!("{:?}", event.kind);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod conversation_store;
pub mod entities;
pub mod error;
pub mod feed;
pub mod message_store;
pub mod migration;
pub mod object_storage;
pub mod presence;
pub mod profile_manager;
pub mod reaction_store;
pub mod rows;

pub use backend::{ChatStore, SqliteStore};
pub use error::{StoreError, StoreResult};
pub use feed::{ChangeEvent, ChangeFeed, ChangeKind, FeedError, FeedFilter, Row, Subscription, Table};
pub use object_storage::{LocalObjectStorage, ObjectStorage};
pub use presence::{PresenceChannel, PresenceHub, PresenceSubscription, PresenceSync};
pub use rows::{
    ConversationRow, MessageKind, MessageRow, NewMessage, ParticipantRow, ProfileRow, ReactionRow,
};

/// Configuration for the store layer
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub db_path: std::path::PathBuf,

    /// Events buffered per change-feed subscriber before it lags (default: 1024)
    pub feed_capacity: usize,

    /// Presence syncs buffered per subscriber (default: 64)
    pub presence_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: std::path::PathBuf::from("foundit-chat.db"),
            feed_capacity: 1024,
            presence_capacity: 64,
        }
    }
}
