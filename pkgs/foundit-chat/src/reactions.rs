//! Reaction ledger - per-message emoji counts plus "my current reaction"
//!
//! Local changes are applied before the store write and rolled back to the exact prior
//! snapshot if the write fails. Remote changes from other identities are folded in by
//! incrementing and decrementing emoji counts according to the change kind.

use foundit_store::{ChangeEvent, ChangeKind, ChatStore, ReactionRow, Row, StoreError};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument, warn};

use crate::error::{ChatError, ChatResult};

/// Aggregate for one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageReactions {
    pub counts: BTreeMap<String, u32>,
    pub mine: Option<String>,
}

impl MessageReactions {
    pub fn count(&self, emoji: &str) -> u32 {
        self.counts.get(emoji).copied().unwrap_or(0)
    }

    fn increment(&mut self, emoji: &str) {
        *self.counts.entry(emoji.to_string()).or_insert(0) += 1;
    }

    fn decrement(&mut self, emoji: &str) {
        if let Some(count) = self.counts.get_mut(emoji) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(emoji);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.mine.is_none()
    }
}

/// Exact copy of the ledger taken before an optimistic change
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSnapshot(HashMap<String, MessageReactions>);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactionLedger {
    me: String,
    messages: HashMap<String, MessageReactions>,
}

impl ReactionLedger {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            messages: HashMap::new(),
        }
    }

    /// Build the aggregate from stored rows
    pub fn load(me: impl Into<String>, rows: Vec<ReactionRow>) -> Self {
        let mut ledger = Self::new(me);
        for row in rows {
            let entry = ledger.messages.entry(row.message_id).or_default();
            entry.increment(&row.emoji);
            if row.user_id == ledger.me {
                entry.mine = Some(row.emoji);
            }
        }
        ledger
    }

    pub fn get(&self, message_id: &str) -> Option<&MessageReactions> {
        self.messages.get(message_id)
    }

    pub fn all(&self) -> &HashMap<String, MessageReactions> {
        &self.messages
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot(self.messages.clone())
    }

    pub fn restore(&mut self, snapshot: LedgerSnapshot) {
        self.messages = snapshot.0;
    }

    /// Drop the aggregate of a message that left local state
    pub fn forget(&mut self, message_id: &str) {
        self.messages.remove(message_id);
    }

    /// Set my reaction slot on a message, replacing whatever was there
    fn apply_local(&mut self, message_id: &str, emoji: Option<&str>) {
        let entry = self.messages.entry(message_id.to_string()).or_default();
        if let Some(previous) = entry.mine.take() {
            entry.decrement(&previous);
        }
        if let Some(emoji) = emoji {
            entry.increment(emoji);
            entry.mine = Some(emoji.to_string());
        }
        if entry.is_empty() {
            self.messages.remove(message_id);
        }
    }

    /// React to a message, replacing my previous reaction
    ///
    /// Reacting again with the same emoji changes nothing. Returns whether the ledger changed.
    #[instrument(skip(self, store))]
    pub async fn add(
        &mut self,
        store: &dyn ChatStore,
        message_id: &str,
        emoji: &str,
    ) -> ChatResult<bool> {
        if emoji.trim().is_empty() {
            return Err(ChatError::Validation("Pick an emoji to react with".to_string()));
        }
        let mine = self.get(message_id).and_then(|r| r.mine.as_deref());
        if mine == Some(emoji) {
            debug!("Reaction {} on {} already set", emoji, message_id);
            return Ok(false);
        }

        let snapshot = self.snapshot();
        self.apply_local(message_id, Some(emoji));

        let written = match store.insert_reaction(message_id, &self.me, emoji).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(_)) => {
                debug!("Reaction on {} exists, replacing it", message_id);
                store.update_reaction(message_id, &self.me, emoji).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("Reaction on {} failed, rolling back: {}", message_id, e);
            self.restore(snapshot);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Withdraw my reaction from a message. Returns whether the ledger changed.
    #[instrument(skip(self, store))]
    pub async fn remove(&mut self, store: &dyn ChatStore, message_id: &str) -> ChatResult<bool> {
        if self.get(message_id).and_then(|r| r.mine.as_ref()).is_none() {
            return Ok(false);
        }

        let snapshot = self.snapshot();
        self.apply_local(message_id, None);

        if let Err(e) = store.delete_reaction(message_id, &self.me).await {
            warn!("Removing reaction on {} failed, rolling back: {}", message_id, e);
            self.restore(snapshot);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Fold a remote reaction change into the aggregate
    ///
    /// Events for messages `in_view` rejects are dropped. Returns whether the ledger changed.
    pub fn apply_remote(&mut self, event: &ChangeEvent, in_view: impl Fn(&str) -> bool) -> bool {
        let Some(message_id) = event.subject().and_then(|row| row.column("message_id")) else {
            return false;
        };
        if !in_view(message_id) {
            debug!("Ignoring reaction event for {} (not in view)", message_id);
            return false;
        }
        let message_id = message_id.to_string();

        let old = match &event.old {
            Some(Row::Reaction(row)) => Some(row.emoji.as_str()),
            _ => None,
        };
        let new = match &event.new {
            Some(Row::Reaction(row)) => Some(row.emoji.as_str()),
            _ => None,
        };

        let entry = self.messages.entry(message_id.clone()).or_default();
        match event.kind {
            ChangeKind::Insert => {
                if let Some(emoji) = new {
                    entry.increment(emoji);
                }
            }
            ChangeKind::Update => {
                if let Some(emoji) = old {
                    entry.decrement(emoji);
                }
                if let Some(emoji) = new {
                    entry.increment(emoji);
                }
            }
            ChangeKind::Delete => {
                if let Some(emoji) = old {
                    entry.decrement(emoji);
                }
            }
        }
        if entry.is_empty() {
            self.messages.remove(&message_id);
        }
        true
    }
}
