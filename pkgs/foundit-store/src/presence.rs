//! Presence hub - ephemeral per-channel state broadcast
//!
//! Nothing here is persisted. A channel holds the latest attributes tracked by each key
//! (usually an identity id) and broadcasts the merged state to all subscribers whenever
//! a key is tracked or untracked.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::feed::FeedError;

/// Merged state of every key tracked on a channel
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSync {
    pub channel: String,
    pub state: HashMap<String, Value>,
}

struct ChannelState {
    members: HashMap<String, Value>,
    tx: broadcast::Sender<PresenceSync>,
}

/// Registry of presence channels, cheap to clone
#[derive(Clone)]
pub struct PresenceHub {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    capacity: usize,
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PresenceHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Handle to a named channel; the channel is created lazily
    pub fn channel(&self, name: impl Into<String>) -> PresenceChannel {
        PresenceChannel {
            hub: self.clone(),
            name: name.into(),
        }
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .get(name)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels currently held in memory
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    fn with_channel<R>(&self, name: &str, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        let mut channels = self.channels.lock();
        let capacity = self.capacity;
        let channel = channels.entry(name.to_string()).or_insert_with(|| ChannelState {
            members: HashMap::new(),
            tx: broadcast::channel(capacity).0,
        });
        let result = f(channel);

        if channel.members.is_empty() && channel.tx.receiver_count() == 0 {
            channels.remove(name);
        }
        result
    }
}

/// A single presence channel
#[derive(Clone)]
pub struct PresenceChannel {
    hub: PresenceHub,
    name: String,
}

impl PresenceChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the attributes tracked for `key` and broadcast the merged state
    pub fn track(&self, key: &str, attributes: Value) {
        self.hub.with_channel(&self.name, |channel| {
            channel.members.insert(key.to_string(), attributes);
            Self::broadcast(&self.name, channel);
        });
    }

    /// Remove `key` from the channel and broadcast the merged state
    pub fn untrack(&self, key: &str) {
        self.hub.with_channel(&self.name, |channel| {
            if channel.members.remove(key).is_some() {
                Self::broadcast(&self.name, channel);
            }
        });
    }

    /// Current merged state
    pub fn state(&self) -> HashMap<String, Value> {
        self.hub
            .channels
            .lock()
            .get(&self.name)
            .map(|c| c.members.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> PresenceSubscription {
        let rx = self
            .hub
            .with_channel(&self.name, |channel| channel.tx.subscribe());
        debug!("Subscribed to presence channel {}", self.name);
        PresenceSubscription { rx }
    }

    fn broadcast(name: &str, channel: &ChannelState) {
        let sync = PresenceSync {
            channel: name.to_string(),
            state: channel.members.clone(),
        };
        let _ = channel.tx.send(sync);
    }
}

/// Receiving side of a presence channel; dropping it unsubscribes
#[derive(Debug)]
pub struct PresenceSubscription {
    rx: broadcast::Receiver<PresenceSync>,
}

impl PresenceSubscription {
    /// Wait for the next merged state
    pub async fn recv(&mut self) -> Result<PresenceSync, FeedError> {
        match self.rx.recv().await {
            Ok(sync) => Ok(sync),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(FeedError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(FeedError::Closed),
        }
    }

    /// Latest queued merged state, collapsing older ones
    pub fn try_recv_latest(&mut self) -> Result<Option<PresenceSync>, FeedError> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(sync) => latest = Some(sync),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(latest),
                // Only the latest state matters, so a lag is harmless here
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return latest.map(Some).ok_or(FeedError::Closed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_track_broadcasts_merged_state() {
        let hub = PresenceHub::new(8);
        let channel = hub.channel("typing:c1");
        let mut sub = channel.subscribe();

        channel.track("alice", json!({ "is_typing": true }));
        channel.track("bob", json!({ "is_typing": false }));

        let sync = sub.try_recv_latest().unwrap().unwrap();
        assert_eq!(sync.state.len(), 2);
        assert_eq!(sync.state["alice"], json!({ "is_typing": true }));
    }

    #[tokio::test]
    async fn test_untrack_removes_key() {
        let hub = PresenceHub::new(8);
        let channel = hub.channel("typing:c1");
        let mut sub = channel.subscribe();

        channel.track("alice", json!({ "is_typing": true }));
        channel.untrack("alice");

        let sync = sub.recv().await.unwrap();
        assert!(sync.state.contains_key("alice"));
        let sync = sub.recv().await.unwrap();
        assert!(sync.state.is_empty());
    }

    #[test]
    fn test_empty_channels_are_pruned() {
        let hub = PresenceHub::new(8);
        let channel = hub.channel("typing:c1");
        let sub = channel.subscribe();
        channel.track("alice", json!({}));
        assert_eq!(hub.subscriber_count("typing:c1"), 1);

        drop(sub);
        channel.untrack("alice");
        assert_eq!(hub.subscriber_count("typing:c1"), 0);
        assert_eq!(hub.channel_count(), 0);
    }
}
