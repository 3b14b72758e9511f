//! Change-feed subscriptions driving the session
//!
//! [`DirectoryFeeds`] live as long as the session and watch conversation rows plus my own
//! memberships. [`ConversationFeeds`] exist only while a conversation is open; dropping
//! them detaches every channel of that conversation.

use foundit_store::{
    ChangeEvent, ChatStore, FeedError, FeedFilter, PresenceHub, PresenceSubscription,
    PresenceSync, Subscription, Table,
};
use tracing::debug;

use crate::signals::typing_channel;

/// Something that arrived on one of the session's subscriptions
#[derive(Debug)]
pub enum Incoming {
    Conversation(Result<ChangeEvent, FeedError>),
    Membership(Result<ChangeEvent, FeedError>),
    Message(Result<ChangeEvent, FeedError>),
    Reaction(Result<ChangeEvent, FeedError>),
    ReadMarker(Result<ChangeEvent, FeedError>),
    Presence(Result<PresenceSync, FeedError>),
}

pub struct DirectoryFeeds {
    conversations: Subscription,
    memberships: Subscription,
}

impl DirectoryFeeds {
    pub fn attach(store: &dyn ChatStore, me: &str) -> Self {
        Self {
            conversations: store.subscribe(FeedFilter::table(Table::Conversations)),
            memberships: store.subscribe(FeedFilter::table(Table::Participants).eq("user_id", me)),
        }
    }

    async fn recv(&mut self) -> Incoming {
        tokio::select! {
            event = self.conversations.recv() => Incoming::Conversation(event),
            event = self.memberships.recv() => Incoming::Membership(event),
        }
    }

    fn try_recv(&mut self) -> Option<Incoming> {
        if let Some(incoming) = self.conversations.try_recv().transpose() {
            return Some(Incoming::Conversation(incoming));
        }
        self.memberships.try_recv().transpose().map(Incoming::Membership)
    }
}

/// Subscriptions of the open conversation
pub struct ConversationFeeds {
    conversation_id: String,
    messages: Subscription,
    reactions: Subscription,
    reads: Subscription,
    presence: PresenceSubscription,
}

impl ConversationFeeds {
    /// Subscribe to everything an open conversation watches
    ///
    /// Self-authored rows are filtered out at the subscription: my messages and reactions
    /// are already applied locally from the write response.
    pub fn attach(
        store: &dyn ChatStore,
        presence: &PresenceHub,
        conversation_id: &str,
        me: &str,
    ) -> Self {
        debug!("Attaching feeds for conversation {}", conversation_id);
        Self {
            conversation_id: conversation_id.to_string(),
            messages: store.subscribe(
                FeedFilter::table(Table::Messages)
                    .eq("conversation_id", conversation_id)
                    .neq("sender_id", me),
            ),
            reactions: store.subscribe(FeedFilter::table(Table::Reactions).neq("user_id", me)),
            reads: store.subscribe(
                FeedFilter::table(Table::Participants)
                    .eq("conversation_id", conversation_id)
                    .neq("user_id", me),
            ),
            presence: presence.channel(typing_channel(conversation_id)).subscribe(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    async fn recv(&mut self) -> Incoming {
        tokio::select! {
            event = self.messages.recv() => Incoming::Message(event),
            event = self.reactions.recv() => Incoming::Reaction(event),
            event = self.reads.recv() => Incoming::ReadMarker(event),
            sync = self.presence.recv() => Incoming::Presence(sync),
        }
    }

    fn try_recv(&mut self) -> Option<Incoming> {
        if let Some(incoming) = self.messages.try_recv().transpose() {
            return Some(Incoming::Message(incoming));
        }
        if let Some(incoming) = self.reactions.try_recv().transpose() {
            return Some(Incoming::Reaction(incoming));
        }
        if let Some(incoming) = self.reads.try_recv().transpose() {
            return Some(Incoming::ReadMarker(incoming));
        }
        self.presence.try_recv_latest().transpose().map(Incoming::Presence)
    }
}

/// Wait for the next item on any attached subscription
pub async fn next_incoming(
    directory: &mut DirectoryFeeds,
    open: Option<&mut ConversationFeeds>,
) -> Incoming {
    match open {
        Some(open) => tokio::select! {
            incoming = directory.recv() => incoming,
            incoming = open.recv() => incoming,
        },
        None => directory.recv().await,
    }
}

/// An item that is already queued on any attached subscription
pub fn try_incoming(
    directory: &mut DirectoryFeeds,
    open: Option<&mut ConversationFeeds>,
) -> Option<Incoming> {
    if let Some(incoming) = directory.try_recv() {
        return Some(incoming);
    }
    open.and_then(|feeds| feeds.try_recv())
}
