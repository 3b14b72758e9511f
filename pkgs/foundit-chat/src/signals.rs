//! Read/typing signals - ephemeral facts kept apart from durable message data

use chrono::{DateTime, Utc};
use foundit_store::{ParticipantRow, PresenceChannel};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const IS_TYPING: &str = "is_typing";

/// Presence channel name used for typing in a conversation
pub fn typing_channel(conversation_id: &str) -> String {
    format!("typing:{}", conversation_id)
}

#[derive(Default)]
struct TypingState {
    typing: bool,
    generation: u64,
}

/// My typing flag on a conversation's presence channel
///
/// A keystroke sets the flag and (re)arms a single revert timer; the flag drops back to
/// false after `timeout` without keystrokes. Presence is only written on transitions.
pub struct TypingSignal {
    channel: PresenceChannel,
    me: String,
    timeout: Duration,
    state: Arc<Mutex<TypingState>>,
    revert: Option<JoinHandle<()>>,
}

impl TypingSignal {
    pub fn new(channel: PresenceChannel, me: impl Into<String>, timeout: Duration) -> Self {
        Self {
            channel,
            me: me.into(),
            timeout,
            state: Arc::new(Mutex::new(TypingState::default())),
            revert: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.state.lock().typing
    }

    pub fn keystroke(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert.abort();
        }

        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            if !state.typing {
                state.typing = true;
                self.channel.track(&self.me, json!({ "is_typing": true }));
            }
            state.generation
        };

        let channel = self.channel.clone();
        let me = self.me.clone();
        let state = self.state.clone();
        let timeout = self.timeout;
        self.revert = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = state.lock();
            // A later keystroke owns the flag now
            if state.generation != generation || !state.typing {
                return;
            }
            state.typing = false;
            channel.track(&me, json!({ "is_typing": false }));
            debug!("Typing on {} reverted after {:?}", channel.name(), timeout);
        }));
    }

    /// Clear the flag immediately
    pub fn stop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert.abort();
        }
        let mut state = self.state.lock();
        state.generation += 1;
        if state.typing {
            state.typing = false;
            self.channel.track(&self.me, json!({ "is_typing": false }));
        }
    }

    /// Stop typing and remove my key from the channel
    pub fn leave(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert.abort();
        }
        let mut state = self.state.lock();
        state.generation += 1;
        state.typing = false;
        self.channel.untrack(&self.me);
    }
}

impl Drop for TypingSignal {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Whether any identity other than `me` is flagged as typing in a presence state
pub fn is_anyone_typing(state: &HashMap<String, Value>, me: &str) -> bool {
    state.iter().any(|(user_id, attributes)| {
        user_id != me && attributes.get(IS_TYPING).and_then(Value::as_bool) == Some(true)
    })
}

/// Last-read markers of the other participants of a conversation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadMap {
    others: HashMap<String, Option<DateTime<Utc>>>,
}

impl ReadMap {
    pub fn from_participants(me: &str, participants: &[ParticipantRow]) -> Self {
        Self {
            others: participants
                .iter()
                .filter(|p| p.user_id != me)
                .map(|p| (p.user_id.clone(), p.last_read_at))
                .collect(),
        }
    }

    pub fn last_read(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.others.get(user_id).copied().flatten()
    }

    /// Seen iff some other participant read at or after `created_at`
    pub fn seen_by_others(&self, created_at: DateTime<Utc>) -> bool {
        self.others
            .values()
            .any(|read| matches!(read, Some(at) if *at >= created_at))
    }

    pub fn len(&self) -> usize {
        self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.others.is_empty()
    }
}
