//! Read models assembled by the engine

use chrono::{DateTime, Utc};
use foundit_store::{MessageKind, MessageRow};
use serde::{Deserialize, Serialize};

/// A conversation as the directory presents it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_message_sender_id: Option<String>,
    /// Every participant, self included, sorted by identity
    pub participants: Vec<Member>,
    pub my_last_read_at: Option<DateTime<Utc>>,
    pub unread: bool,
}

/// A participant with its display profile, when one exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }

    /// Sorted participant ids joined, identifying the logical conversation
    pub fn canonical_key(&self) -> String {
        canonical_key(self.participants.iter().map(|m| m.user_id.as_str()))
    }

    /// Participants other than `me`
    pub fn others<'a>(&'a self, me: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.participants.iter().filter(move |m| m.user_id != me)
    }

    /// Derived unread flag: a message arrived after my last read
    pub fn compute_unread(&self) -> bool {
        match (self.last_message_at, self.my_last_read_at) {
            (Some(last), Some(read)) => last > read,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Record my own read marker and re-derive the unread flag
    pub fn set_my_last_read(&mut self, me: &str, at: DateTime<Utc>) {
        self.my_last_read_at = Some(at);
        if let Some(member) = self.participants.iter_mut().find(|m| m.user_id == me) {
            member.last_read_at = Some(at);
        }
        self.unread = self.compute_unread();
    }
}

/// Canonical participant-set key: ids sorted, deduplicated and joined
pub fn canonical_key<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut ids: Vec<&str> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    ids.join(",")
}

/// Metadata stored on image messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub url: String,
    pub path: String,
    pub content_type: String,
    pub size: usize,
    pub width: u32,
    pub height: u32,
}

impl ImageAttachment {
    pub fn from_message(message: &MessageRow) -> Option<Self> {
        if message.kind != MessageKind::Image {
            return None;
        }
        message
            .metadata
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation(last_message_at: Option<DateTime<Utc>>) -> Conversation {
        Conversation {
            id: "c1".into(),
            created_at: Utc::now() - Duration::hours(1),
            last_message_at,
            last_message: None,
            last_message_sender_id: None,
            participants: vec![
                Member {
                    user_id: "bob".into(),
                    display_name: None,
                    avatar_url: None,
                    last_read_at: None,
                },
                Member {
                    user_id: "alice".into(),
                    display_name: Some("Alice".into()),
                    avatar_url: None,
                    last_read_at: None,
                },
            ],
            my_last_read_at: None,
            unread: false,
        }
    }

    #[test]
    fn test_canonical_key_is_order_independent() {
        assert_eq!(canonical_key(["bob", "alice"]), canonical_key(["alice", "bob"]));
        assert_eq!(canonical_key(["alice", "bob", "alice"]), "alice,bob");
        assert_eq!(conversation(None).canonical_key(), "alice,bob");
    }

    #[test]
    fn test_unread_is_derived_from_last_read() {
        let now = Utc::now();
        let mut c = conversation(Some(now));
        assert!(c.compute_unread());

        c.set_my_last_read("alice", now);
        assert!(!c.unread);
        assert_eq!(c.participants[1].last_read_at, Some(now));

        c.last_message_at = Some(now + Duration::seconds(1));
        assert!(c.compute_unread());

        assert!(!conversation(None).compute_unread());
    }
}
