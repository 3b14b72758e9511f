//! Change feed - row-level insert/update/delete events with filtered subscriptions
//!
//! Every successful write in [`crate::SqliteStore`] publishes one [`ChangeEvent`] after it
//! commits. Subscribers describe what they care about with a [`FeedFilter`]: a table plus
//! optional column predicates, e.g. "messages where `conversation_id = X` and
//! `sender_id != me`". Events that do not match are skipped inside the subscription, so a
//! consumer never sees them.
//!
//! Delivery is a bounded broadcast. A subscriber that falls too far behind gets
//! [`FeedError::Lagged`] and is expected to reload whatever the subscription was tracking.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::rows::{ConversationRow, MessageRow, ParticipantRow, ProfileRow, ReactionRow};

/// Tables that publish change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Conversations,
    Participants,
    Messages,
    Reactions,
    Profiles,
}

/// Change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row carried by a change event
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Conversation(ConversationRow),
    Participant(ParticipantRow),
    Message(MessageRow),
    Reaction(ReactionRow),
    Profile(ProfileRow),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Conversation(_) => Table::Conversations,
            Row::Participant(_) => Table::Participants,
            Row::Message(_) => Table::Messages,
            Row::Reaction(_) => Table::Reactions,
            Row::Profile(_) => Table::Profiles,
        }
    }

    /// Value of a text column, by column name
    pub fn column(&self, name: &str) -> Option<&str> {
        match (self, name) {
            (Row::Conversation(c), "id") => Some(&c.id),
            (Row::Conversation(c), "last_message_sender_id") => c.last_message_sender_id.as_deref(),
            (Row::Participant(p), "conversation_id") => Some(&p.conversation_id),
            (Row::Participant(p), "user_id") => Some(&p.user_id),
            (Row::Message(m), "id") => Some(&m.id),
            (Row::Message(m), "conversation_id") => Some(&m.conversation_id),
            (Row::Message(m), "sender_id") => Some(&m.sender_id),
            (Row::Message(m), "kind") => Some(m.kind.as_str()),
            (Row::Reaction(r), "message_id") => Some(&r.message_id),
            (Row::Reaction(r), "user_id") => Some(&r.user_id),
            (Row::Reaction(r), "emoji") => Some(&r.emoji),
            (Row::Profile(p), "user_id") => Some(&p.user_id),
            _ => None,
        }
    }
}

/// A single row-level change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub new: Option<Row>,
    pub old: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(row: Row) -> Self {
        Self {
            table: row.table(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(old: Option<Row>, new: Row) -> Self {
        Self {
            table: new.table(),
            kind: ChangeKind::Update,
            new: Some(new),
            old,
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            table: old.table(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// The row filters are evaluated against: the old row for deletes, the new row otherwise
    pub fn subject(&self) -> Option<&Row> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref(),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }
}

/// Subscription filter: a table plus column predicates
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFilter {
    table: Table,
    eq: Vec<(String, String)>,
    neq: Vec<(String, String)>,
}

impl FeedFilter {
    pub fn table(table: Table) -> Self {
        Self {
            table,
            eq: Vec::new(),
            neq: Vec::new(),
        }
    }

    /// Only events whose `column` equals `value`
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    /// Only events whose `column` does not equal `value`
    pub fn neq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.neq.push((column.into(), value.into()));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        let Some(row) = event.subject() else {
            return false;
        };

        self.eq
            .iter()
            .all(|(column, value)| row.column(column) == Some(value.as_str()))
            && self
                .neq
                .iter()
                .all(|(column, value)| row.column(column) != Some(value.as_str()))
    }
}

/// Errors a subscription can yield
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Subscriber lagged behind, {0} events dropped")]
    Lagged(u64),
    #[error("Change feed closed")]
    Closed,
}

/// Publishing side of the change feed
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to every live subscription
    pub fn publish(&self, event: ChangeEvent) {
        debug!("Publishing {:?} on {:?}", event.kind, event.table);
        // No receivers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, filter: FeedFilter) -> Subscription {
        debug!("New subscription on {:?}", filter.table);
        Subscription {
            filter,
            rx: self.tx.subscribe(),
        }
    }

    /// Number of subscriptions currently attached
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of a filtered subscription; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    filter: FeedFilter,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }

    /// Wait for the next matching event
    pub async fn recv(&mut self) -> Result<ChangeEvent, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscription on {:?} lagged, {} events dropped",
                        self.filter.table, skipped
                    );
                    return Err(FeedError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }

    /// Next matching event if one is already queued
    pub fn try_recv(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Ok(Some(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscription on {:?} lagged, {} events dropped",
                        self.filter.table, skipped
                    );
                    return Err(FeedError::Lagged(skipped));
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}
