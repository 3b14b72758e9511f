//! Row types handed to the engine and carried on the change feed

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entities::{conversations, messages, participants, profiles, reactions};
use crate::error::StoreError;

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Message kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => Err(StoreError::InvalidRow(format!("unknown message kind '{}'", other))),
        }
    }
}

/// Conversation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_message_sender_id: Option<String>,
}

impl ConversationRow {
    /// Last activity: the last message time, or creation time for an empty conversation
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

impl From<conversations::Model> for ConversationRow {
    fn from(model: conversations::Model) -> Self {
        Self {
            id: model.id,
            created_at: from_millis(model.created_at),
            last_message_at: model.last_message_at.map(from_millis),
            last_message: model.last_message,
            last_message_sender_id: model.last_message_sender_id,
        }
    }
}

/// Participant (membership) row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub last_read_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

impl From<participants::Model> for ParticipantRow {
    fn from(model: participants::Model) -> Self {
        Self {
            conversation_id: model.conversation_id,
            user_id: model.user_id,
            last_read_at: model.last_read_at.map(from_millis),
            joined_at: from_millis(model.joined_at),
        }
    }
}

/// Message row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

impl TryFrom<messages::Model> for MessageRow {
    type Error = StoreError;

    fn try_from(model: messages::Model) -> Result<Self, Self::Error> {
        let metadata = model
            .metadata_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Self {
            seq: model.seq,
            id: model.id,
            conversation_id: model.conversation_id,
            sender_id: model.sender_id,
            kind: model.kind.parse()?,
            content: model.content,
            metadata,
            created_at: from_millis(model.created_at),
            deleted: model.deleted,
        })
    }
}

/// A message to be inserted; id, sequence and timestamp are assigned by the store
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

/// Reaction row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<reactions::Model> for ReactionRow {
    fn from(model: reactions::Model) -> Self {
        Self {
            message_id: model.message_id,
            user_id: model.user_id,
            emoji: model.emoji,
            created_at: from_millis(model.created_at),
            updated_at: from_millis(model.updated_at),
        }
    }
}

/// Identity display profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRow {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl From<profiles::Model> for ProfileRow {
    fn from(model: profiles::Model) -> Self {
        Self {
            user_id: model.user_id,
            display_name: model.display_name,
            avatar_url: model.avatar_url,
        }
    }
}
