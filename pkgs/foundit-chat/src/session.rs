//! Chat session - local state for one identity plus the operations that mutate it
//!
//! The session is driven cooperatively by its host. Public operations write to the store and
//! apply their own result locally; remote changes are applied when the host calls
//! [`ChatSession::next_update`], [`ChatSession::apply_update`] or
//! [`ChatSession::process_pending`]. Every change to local
//! state is announced on the [`SessionEvent`] receiver returned by [`ChatSession::start`].
//!
//! At most one conversation is open. Opening attaches its message, reaction, read-marker and
//! typing subscriptions; closing drops all of them.

use chrono::{DateTime, Utc};
use foundit_store::{
    ChangeEvent, ChangeKind, ChatStore, FeedError, MessageRow, ObjectStorage, PresenceHub, Row,
};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::attachments::{AttachmentPipeline, HeadProbe, ReachabilityProbe};
use crate::composer::MessageComposer;
use crate::config::ChatConfig;
use crate::coordinator::{next_incoming, try_incoming, ConversationFeeds, DirectoryFeeds, Incoming};
use crate::directory::ConversationDirectory;
use crate::error::{ChatError, ChatResult};
use crate::models::Conversation;
use crate::notify::{LogNotifier, Notifier};
use crate::reactions::{MessageReactions, ReactionLedger};
use crate::signals::{is_anyone_typing, typing_channel, ReadMap, TypingSignal};

/// Local state changes and user-facing notices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConversationsChanged,
    MessagesChanged,
    ReactionsChanged,
    ReadMapChanged,
    TypingChanged(bool),
    /// Exactly one per failed operation
    Notice(String),
}

/// Capabilities a session runs against
pub struct Backends {
    pub store: Arc<dyn ChatStore>,
    pub objects: Arc<dyn ObjectStorage>,
    pub presence: PresenceHub,
    pub notifier: Arc<dyn Notifier>,
    pub probe: Arc<dyn ReachabilityProbe>,
}

impl Backends {
    /// Backends with a logging notifier and the default reachability probe
    pub fn new(
        store: Arc<dyn ChatStore>,
        objects: Arc<dyn ObjectStorage>,
        presence: PresenceHub,
    ) -> Self {
        Self {
            store,
            objects,
            presence,
            notifier: Arc::new(LogNotifier),
            probe: Arc::new(HeadProbe::default()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }
}

struct EventSink(UnboundedSender<SessionEvent>);

impl EventSink {
    fn emit(&self, event: SessionEvent) {
        if self.0.unbounded_send(event).is_err() {
            debug!("Session event dropped, receiver is gone");
        }
    }

    /// Pass `result` through, announcing a failure as a notice
    fn surface<T>(&self, result: ChatResult<T>) -> ChatResult<T> {
        if let Err(e) = &result {
            warn!("Operation failed: {}", e);
            self.emit(SessionEvent::Notice(e.user_message()));
        }
        result
    }
}

/// What a lagged subscription reloads
#[derive(Debug, Clone, Copy)]
enum Resync {
    Directory,
    OpenConversation,
}

struct OpenConversation {
    feeds: ConversationFeeds,
    typing: TypingSignal,
    messages: Vec<MessageRow>,
    /// Highest `seq` in the loaded history; queued inserts at or below it are already shown
    watermark: i64,
    ledger: ReactionLedger,
    reads: ReadMap,
    anyone_typing: bool,
}

impl OpenConversation {
    fn id(&self) -> &str {
        self.feeds.conversation_id()
    }

    fn holds(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    /// Insert keeping (created_at, seq) order
    fn splice(&mut self, message: MessageRow) {
        let key = (message.created_at, message.seq);
        let at = self
            .messages
            .partition_point(|m| (m.created_at, m.seq) <= key);
        self.messages.insert(at, message);
    }

    fn remove(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        self.ledger.forget(message_id);
        self.messages.len() != before
    }
}

pub struct ChatSession {
    me: String,
    config: ChatConfig,
    store: Arc<dyn ChatStore>,
    presence: PresenceHub,
    directory: ConversationDirectory,
    composer: MessageComposer,
    events: EventSink,
    feeds: DirectoryFeeds,
    conversations: Vec<Conversation>,
    open: Option<OpenConversation>,
}

impl ChatSession {
    /// Start a session for `me` and load the conversation list
    pub async fn start(
        me: impl Into<String>,
        config: ChatConfig,
        backends: Backends,
    ) -> ChatResult<(Self, UnboundedReceiver<SessionEvent>)> {
        let me = me.into();
        if me.trim().is_empty() {
            return Err(ChatError::Validation("An identity is required".to_string()));
        }

        let Backends {
            store,
            objects,
            presence,
            notifier,
            probe,
        } = backends;
        let (tx, rx) = mpsc::unbounded();

        let attachments = AttachmentPipeline::new(objects, probe, config.clone());
        let composer = MessageComposer::new(
            me.clone(),
            store.clone(),
            attachments,
            notifier,
            config.clone(),
        );

        let mut session = Self {
            feeds: DirectoryFeeds::attach(store.as_ref(), &me),
            directory: ConversationDirectory::new(store.clone()),
            me,
            config,
            store,
            presence,
            composer,
            events: EventSink(tx),
            conversations: Vec::new(),
            open: None,
        };
        session.relist().await?;

        info!(
            "Chat session started for {} ({} conversations)",
            session.me,
            session.conversations.len()
        );
        Ok((session, rx))
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    #[instrument(skip(self))]
    pub async fn refresh_conversations(&mut self) -> ChatResult<()> {
        let result = self.relist().await;
        self.events.surface(result)
    }

    /// Id of the conversation with exactly `others` (plus me), created if needed
    #[instrument(skip(self))]
    pub async fn create_or_get_conversation(&mut self, others: &[String]) -> ChatResult<String> {
        let result = self.directory.create_or_get(&self.me, others).await;
        let id = self.events.surface(result)?;
        self.relist_or_notify().await;
        Ok(id)
    }

    /// Delete a conversation with its messages, reactions and participants
    #[instrument(skip(self))]
    pub async fn delete_conversation(&mut self, conversation_id: &str) -> ChatResult<()> {
        self.close(conversation_id);

        let result = self
            .store
            .delete_conversation(conversation_id)
            .await
            .map_err(ChatError::from);
        self.events.surface(result)?;

        self.conversations.retain(|c| c.id != conversation_id);
        self.events.emit(SessionEvent::ConversationsChanged);
        Ok(())
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }

    /// Number of listed conversations with unread messages
    pub fn total_unread(&self) -> usize {
        self.conversations.iter().filter(|c| c.unread).count()
    }

    /// Open a conversation, closing the current one first
    #[instrument(skip(self))]
    pub async fn open(&mut self, conversation_id: &str) -> ChatResult<()> {
        if self.open_conversation_id() == Some(conversation_id) {
            return Ok(());
        }
        if let Some(current) = self.open_conversation_id().map(str::to_string) {
            self.close(&current);
        }

        let result = self.load_open(conversation_id).await;
        let open = self.events.surface(result)?;
        let anyone_typing = open.anyone_typing;
        self.open = Some(open);

        self.events.emit(SessionEvent::MessagesChanged);
        self.events.emit(SessionEvent::ReactionsChanged);
        self.events.emit(SessionEvent::ReadMapChanged);
        if anyone_typing {
            self.events.emit(SessionEvent::TypingChanged(true));
        }

        self.mark_read_quietly(conversation_id).await;
        info!("Opened conversation {}", conversation_id);
        Ok(())
    }

    /// Subscribe first, then load, so nothing arriving in between is missed
    async fn load_open(&self, conversation_id: &str) -> ChatResult<OpenConversation> {
        let feeds =
            ConversationFeeds::attach(self.store.as_ref(), &self.presence, conversation_id, &self.me);

        let participants = self
            .store
            .participants_in(&[conversation_id.to_string()])
            .await?;
        if !participants.iter().any(|p| p.user_id == self.me) {
            return Err(ChatError::Validation(
                "You are not part of this conversation".to_string(),
            ));
        }

        let messages = self.store.messages_in(conversation_id).await?;
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let ledger = ReactionLedger::load(self.me.clone(), self.store.reactions_for(&ids).await?);
        let watermark = messages.iter().map(|m| m.seq).max().unwrap_or(0);

        let channel = self.presence.channel(typing_channel(conversation_id));
        let anyone_typing = is_anyone_typing(&channel.state(), &self.me);
        let typing = TypingSignal::new(channel, self.me.clone(), self.config.typing_timeout);

        debug!(
            "Loaded {} messages of {} (watermark {})",
            messages.len(),
            conversation_id,
            watermark
        );
        Ok(OpenConversation {
            feeds,
            typing,
            messages,
            watermark,
            ledger,
            reads: ReadMap::from_participants(&self.me, &participants),
            anyone_typing,
        })
    }

    /// Close `conversation_id` if it is the open one, detaching all of its subscriptions
    #[instrument(skip(self))]
    pub fn close(&mut self, conversation_id: &str) -> bool {
        if self.open_conversation_id() != Some(conversation_id) {
            return false;
        }
        let Some(mut open) = self.open.take() else {
            return false;
        };

        open.typing.leave();
        let anyone_typing = open.anyone_typing;
        drop(open);

        if anyone_typing {
            self.events.emit(SessionEvent::TypingChanged(false));
        }
        self.events.emit(SessionEvent::MessagesChanged);
        info!("Closed conversation {}", conversation_id);
        true
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.id())
    }

    #[instrument(skip(self, text))]
    pub async fn send_text(&mut self, conversation_id: &str, text: &str) -> ChatResult<MessageRow> {
        let result = self.composer.post_text(conversation_id, text).await;
        let message = self.events.surface(result)?;
        self.after_send(&message).await;
        Ok(message)
    }

    #[instrument(skip(self))]
    pub async fn send_image(
        &mut self,
        conversation_id: &str,
        local: &Path,
    ) -> ChatResult<MessageRow> {
        let result = self.composer.post_image(conversation_id, local).await;
        let message = self.events.surface(result)?;
        self.after_send(&message).await;
        Ok(message)
    }

    /// Send each image as its own message, in order, up to the configured cap
    ///
    /// One image failing does not stop the rest; each failure gets its own notice.
    #[instrument(skip(self, locals), fields(count = locals.len()))]
    pub async fn send_images(
        &mut self,
        conversation_id: &str,
        locals: &[PathBuf],
    ) -> Vec<ChatResult<MessageRow>> {
        let cap = self.config.max_images_per_send;
        if locals.len() > cap {
            warn!(
                "Only the first {} of {} images will be sent",
                cap,
                locals.len()
            );
        }

        let mut results = Vec::with_capacity(locals.len().min(cap));
        for local in locals.iter().take(cap) {
            results.push(self.send_image(conversation_id, local).await);
        }
        results
    }

    /// Splice a committed send into local state and run the secondary bookkeeping
    async fn after_send(&mut self, message: &MessageRow) {
        if let Some(open) = self.open.as_mut() {
            if open.id() == message.conversation_id {
                open.typing.stop();
                open.splice(message.clone());
                self.events.emit(SessionEvent::MessagesChanged);
            }
        }

        if let Some(read_at) = self.composer.settle(message).await {
            self.apply_my_read(&message.conversation_id, read_at);
        }
        self.relist_or_notify().await;
    }

    /// Soft-delete one of my messages. Unknown and foreign messages are a silent no-op.
    #[instrument(skip(self))]
    pub async fn delete_message(&mut self, message_id: &str) -> ChatResult<bool> {
        let result = self
            .store
            .soft_delete_message(message_id, &self.me)
            .await
            .map_err(ChatError::from);
        let changed = self.events.surface(result)? > 0;

        if !changed {
            debug!("Delete of {} changed nothing", message_id);
            return Ok(false);
        }
        if let Some(open) = self.open.as_mut() {
            if open.remove(message_id) {
                self.events.emit(SessionEvent::MessagesChanged);
            }
        }
        Ok(true)
    }

    /// Messages of the open conversation, oldest first
    pub fn messages(&self) -> &[MessageRow] {
        self.open
            .as_ref()
            .map(|o| o.messages.as_slice())
            .unwrap_or_default()
    }

    #[instrument(skip(self))]
    pub async fn add_reaction(&mut self, message_id: &str, emoji: &str) -> ChatResult<()> {
        let result = match self.open.as_mut() {
            None => Err(ChatError::NotOpen),
            Some(open) if !open.holds(message_id) => {
                Err(ChatError::Validation("That message is no longer here".to_string()))
            }
            Some(open) => open.ledger.add(self.store.as_ref(), message_id, emoji).await,
        };
        if self.events.surface(result)? {
            self.events.emit(SessionEvent::ReactionsChanged);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_reaction(&mut self, message_id: &str) -> ChatResult<()> {
        let result = match self.open.as_mut() {
            None => Err(ChatError::NotOpen),
            Some(open) => open.ledger.remove(self.store.as_ref(), message_id).await,
        };
        if self.events.surface(result)? {
            self.events.emit(SessionEvent::ReactionsChanged);
        }
        Ok(())
    }

    pub fn reactions(&self, message_id: &str) -> Option<&MessageReactions> {
        self.open.as_ref().and_then(|o| o.ledger.get(message_id))
    }

    /// Reaction aggregate of every message in view
    pub fn reaction_ledger(&self) -> Option<&HashMap<String, MessageReactions>> {
        self.open.as_ref().map(|o| o.ledger.all())
    }

    /// Record that I have read `conversation_id` up to now
    #[instrument(skip(self))]
    pub async fn mark_read(&mut self, conversation_id: &str) -> ChatResult<()> {
        let at = Utc::now();
        let result = self
            .store
            .set_last_read(conversation_id, &self.me, at)
            .await
            .map_err(ChatError::from);
        self.events.surface(result)?;
        self.apply_my_read(conversation_id, at);
        Ok(())
    }

    async fn mark_read_quietly(&mut self, conversation_id: &str) {
        let at = Utc::now();
        match self.store.set_last_read(conversation_id, &self.me, at).await {
            Ok(()) => self.apply_my_read(conversation_id, at),
            Err(e) => warn!("Failed to mark {} read: {}", conversation_id, e),
        }
    }

    fn apply_my_read(&mut self, conversation_id: &str, at: DateTime<Utc>) {
        let me = self.me.as_str();
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return;
        };
        if conversation.my_last_read_at.is_some_and(|current| current >= at) {
            return;
        }
        conversation.set_my_last_read(me, at);
        self.events.emit(SessionEvent::ConversationsChanged);
    }

    /// A keystroke in the open conversation's composer
    pub fn keystroke(&mut self) {
        if let Some(open) = self.open.as_mut() {
            open.typing.keystroke();
        }
    }

    pub fn stop_typing(&mut self) {
        if let Some(open) = self.open.as_mut() {
            open.typing.stop();
        }
    }

    /// Whether another participant of the open conversation is typing
    pub fn is_anyone_typing(&self) -> bool {
        self.open.as_ref().is_some_and(|o| o.anyone_typing)
    }

    /// Whether another participant has read at or after this message was created
    pub fn is_seen_by_others(&self, message_id: &str) -> bool {
        let Some(open) = self.open.as_ref() else {
            return false;
        };
        open.messages
            .iter()
            .find(|m| m.id == message_id)
            .is_some_and(|m| open.reads.seen_by_others(m.created_at))
    }

    pub fn read_map(&self) -> Option<&ReadMap> {
        self.open.as_ref().map(|o| &o.reads)
    }

    /// Wait for the next change on any attached subscription and apply it
    ///
    /// Not cancel-safe: applying a change awaits store writes after local state has moved.
    /// Hosts that race the session against other sources in `select!` should select on
    /// [`ChatSession::recv_update`] and call [`ChatSession::apply_update`] outside of it.
    pub async fn next_update(&mut self) -> ChatResult<()> {
        let incoming = self.recv_update().await;
        self.apply_update(incoming).await
    }

    /// Wait for the next change on any attached subscription without applying it
    ///
    /// Cancel-safe. Nothing is consumed unless the future completes.
    pub async fn recv_update(&mut self) -> Incoming {
        next_incoming(&mut self.feeds, self.open.as_mut().map(|o| &mut o.feeds)).await
    }

    /// Apply a change returned by [`ChatSession::recv_update`]. Failures are surfaced as a notice.
    pub async fn apply_update(&mut self, incoming: Incoming) -> ChatResult<()> {
        self.apply(incoming).await
    }

    /// Apply every change that is already queued, without waiting. Returns how many.
    pub async fn process_pending(&mut self) -> ChatResult<usize> {
        let mut applied = 0;
        while let Some(incoming) =
            try_incoming(&mut self.feeds, self.open.as_mut().map(|o| &mut o.feeds))
        {
            self.apply(incoming).await?;
            applied += 1;
        }
        Ok(applied)
    }

    async fn apply(&mut self, incoming: Incoming) -> ChatResult<()> {
        let result = match incoming {
            Incoming::Conversation(Ok(event)) => self.on_conversation_change(event).await,
            Incoming::Membership(Ok(event)) => self.on_membership_change(event).await,
            Incoming::Message(Ok(event)) => {
                self.on_message(event).await;
                Ok(())
            }
            Incoming::Reaction(Ok(event)) => {
                self.on_reaction(event);
                Ok(())
            }
            Incoming::ReadMarker(Ok(_)) => self.reload_reads().await,
            Incoming::Presence(Ok(sync)) => {
                self.on_presence(&sync.state);
                Ok(())
            }
            Incoming::Conversation(Err(e)) | Incoming::Membership(Err(e)) => {
                self.resync(e, Resync::Directory).await
            }
            Incoming::Message(Err(e))
            | Incoming::Reaction(Err(e))
            | Incoming::ReadMarker(Err(e)) => {
                self.resync(e, Resync::OpenConversation).await
            }
            Incoming::Presence(Err(FeedError::Closed)) => Err(ChatError::Disconnected),
            Incoming::Presence(Err(FeedError::Lagged(_))) => {
                let state = self
                    .open
                    .as_ref()
                    .map(|o| self.presence.channel(typing_channel(o.id())).state());
                if let Some(state) = state {
                    self.on_presence(&state);
                }
                Ok(())
            }
        };
        self.events.surface(result)
    }

    async fn resync(&mut self, error: FeedError, what: Resync) -> ChatResult<()> {
        match error {
            FeedError::Closed => Err(ChatError::Disconnected),
            FeedError::Lagged(skipped) => {
                warn!("Missed {} changes, reloading {:?}", skipped, what);
                match what {
                    Resync::Directory => self.relist().await,
                    Resync::OpenConversation => self.reload_open().await,
                }
            }
        }
    }

    async fn relist(&mut self) -> ChatResult<()> {
        self.conversations = self.directory.list(&self.me).await?;
        self.events.emit(SessionEvent::ConversationsChanged);
        Ok(())
    }

    async fn relist_or_notify(&mut self) {
        let result = self.relist().await;
        let _ = self.events.surface(result);
    }

    async fn on_conversation_change(&mut self, event: ChangeEvent) -> ChatResult<()> {
        let listed = event
            .subject()
            .and_then(|row| row.column("id"))
            .is_some_and(|id| self.conversations.iter().any(|c| c.id == id));
        if !listed {
            return Ok(());
        }
        if event.kind == ChangeKind::Delete {
            if let Some(id) = event.subject().and_then(|row| row.column("id")) {
                self.close(&id.to_string());
            }
        }
        debug!("Conversation {:?} changed, relisting", event.kind);
        self.relist().await
    }

    async fn on_membership_change(&mut self, event: ChangeEvent) -> ChatResult<()> {
        match (event.kind, &event.new) {
            (ChangeKind::Update, Some(Row::Participant(participant))) => {
                if let Some(at) = participant.last_read_at {
                    let conversation_id = participant.conversation_id.clone();
                    self.apply_my_read(&conversation_id, at);
                }
                Ok(())
            }
            _ => {
                debug!("Membership {:?}, relisting", event.kind);
                self.relist().await
            }
        }
    }

    async fn on_message(&mut self, event: ChangeEvent) {
        let Some(open) = self.open.as_mut() else {
            return;
        };

        match (event.kind, event.new, event.old) {
            (ChangeKind::Insert, Some(Row::Message(message)), _) => {
                if message.seq <= open.watermark || message.deleted {
                    debug!("Skipping message {} already covered by history", message.id);
                    return;
                }
                debug!("Received message {} from {}", message.id, message.sender_id);
                let conversation_id = message.conversation_id.clone();
                open.splice(message);
                self.events.emit(SessionEvent::MessagesChanged);
                self.mark_read_quietly(&conversation_id).await;
            }
            (ChangeKind::Update, Some(Row::Message(message)), _) => {
                let changed = if message.deleted {
                    open.remove(&message.id)
                } else if let Some(existing) = open.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message;
                    true
                } else {
                    false
                };
                if changed {
                    self.events.emit(SessionEvent::MessagesChanged);
                }
            }
            (ChangeKind::Delete, _, Some(Row::Message(message))) => {
                if open.remove(&message.id) {
                    self.events.emit(SessionEvent::MessagesChanged);
                }
            }
            _ => {}
        }
    }

    fn on_reaction(&mut self, event: ChangeEvent) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let messages = &open.messages;
        let changed = open
            .ledger
            .apply_remote(&event, |id| messages.iter().any(|m| m.id == id));
        if changed {
            self.events.emit(SessionEvent::ReactionsChanged);
        }
    }

    fn on_presence(&mut self, state: &HashMap<String, serde_json::Value>) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let anyone = is_anyone_typing(state, &self.me);
        if anyone != open.anyone_typing {
            open.anyone_typing = anyone;
            self.events.emit(SessionEvent::TypingChanged(anyone));
        }
    }

    async fn reload_reads(&mut self) -> ChatResult<()> {
        let Some(conversation_id) = self.open_conversation_id().map(str::to_string) else {
            return Ok(());
        };
        let participants = self.store.participants_in(&[conversation_id]).await?;
        let reads = ReadMap::from_participants(&self.me, &participants);

        if let Some(open) = self.open.as_mut() {
            if open.reads != reads {
                open.reads = reads;
                self.events.emit(SessionEvent::ReadMapChanged);
            }
        }
        Ok(())
    }

    /// Reload history, reactions and read markers of the open conversation
    async fn reload_open(&mut self) -> ChatResult<()> {
        let Some(conversation_id) = self.open_conversation_id().map(str::to_string) else {
            return Ok(());
        };
        let messages = self.store.messages_in(&conversation_id).await?;
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let ledger = ReactionLedger::load(self.me.clone(), self.store.reactions_for(&ids).await?);
        let participants = self.store.participants_in(&[conversation_id]).await?;

        if let Some(open) = self.open.as_mut() {
            open.watermark = messages.iter().map(|m| m.seq).max().unwrap_or(0);
            open.messages = messages;
            open.ledger = ledger;
            open.reads = ReadMap::from_participants(&self.me, &participants);
        }
        self.events.emit(SessionEvent::MessagesChanged);
        self.events.emit(SessionEvent::ReactionsChanged);
        self.events.emit(SessionEvent::ReadMapChanged);
        Ok(())
    }
}
