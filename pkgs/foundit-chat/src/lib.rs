//! Foundit Chat - real-time messaging synchronization engine
//!
//! Keeps a locally consistent view of conversations and messages while changes arrive from
//! local sends, remote change-feed events and reloads, with typing, read receipts and
//! reactions layered on top.
//!
//! - **ConversationDirectory**: batched listing, participant-set dedup, create-or-get
//! - **MessageComposer**: text and image sends plus the bookkeeping after a send
//! - **AttachmentPipeline**: downscale, upload with timeout and retry, resolve, probe
//! - **ReactionLedger**: emoji aggregates with optimistic apply and exact rollback
//! - **TypingSignal / ReadMap**: ephemeral typing flags and read-receipt derivation
//! - **ChatSession**: owns local state and applies change-feed events to it
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use foundit_chat::{Backends, ChatConfig, ChatSession, SessionEvent};
//! use foundit_store::{LocalObjectStorage, PresenceHub, SqliteStore, StoreConfig};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::new(StoreConfig::default()).await?);
//! let objects = Arc::new(LocalObjectStorage::new("objects"));
//! let backends = Backends::new(store, objects, PresenceHub::default());
//!
//! let (mut session, mut events) = ChatSession::start("alice", ChatConfig::default(), backends).await?;
//! let conversation_id = session.create_or_get_conversation(&["bob".to_string()]).await?;
//! session.open(&conversation_id).await?;
//! session.send_text(&conversation_id, "I think I found your wallet").await?;
//!
//! loop {
//!     // Only the receive step is raced; applying runs to completion
//!     tokio::select! {
//!         incoming = session.recv_update() => {
//!             session.apply_update(incoming).await?;
//!         }
//!         Some(event) = events.next() => {
//!             if let SessionEvent::Notice(text) = event {
//!                 eprintln!("{}", text);
//!             }
//!         }
//!     }
//! }
//! # }
//! ```

pub mod attachments;
pub mod composer;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod models;
pub mod notify;
pub mod reactions;
pub mod session;
pub mod signals;

pub use attachments::{AttachmentPipeline, HeadProbe, ReachabilityProbe};
pub use composer::MessageComposer;
pub use config::ChatConfig;
pub use coordinator::Incoming;
pub use directory::ConversationDirectory;
pub use error::{ChatError, ChatResult};
pub use models::{canonical_key, Conversation, ImageAttachment, Member};
pub use notify::{LogNotifier, Notifier, SendNotification};
pub use reactions::{LedgerSnapshot, MessageReactions, ReactionLedger};
pub use session::{Backends, ChatSession, SessionEvent};
pub use signals::{is_anyone_typing, ReadMap, TypingSignal};
