#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use foundit_chat::{Backends, ChatConfig, ChatSession, ReachabilityProbe, SessionEvent};
use foundit_store::{
    ChatStore, ConversationRow, FeedFilter, LocalObjectStorage, MessageRow, NewMessage,
    ObjectStorage, ParticipantRow, PresenceHub, ProfileRow, ReactionRow, SqliteStore, StoreConfig,
    StoreError, StoreResult, Subscription,
};
use futures::channel::mpsc::UnboundedReceiver;
use futures::{FutureExt, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use url::Url;

/// A store, object root and presence hub shared by every session of a test
pub struct Harness {
    _db_file: NamedTempFile,
    pub objects_dir: TempDir,
    pub sqlite: Arc<SqliteStore>,
    pub store: Arc<FlakyStore>,
    pub objects: Arc<FlakyStorage>,
    pub presence: PresenceHub,
    pub config: ChatConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store_config(|_| {}).await
    }

    pub async fn with_store_config(adjust: impl FnOnce(&mut StoreConfig)) -> Self {
        let db_file = NamedTempFile::new().expect("Failed to create temp db");
        let mut config = StoreConfig {
            db_path: db_file.path().to_path_buf(),
            ..Default::default()
        };
        adjust(&mut config);

        let sqlite = Arc::new(
            SqliteStore::new(config)
                .await
                .expect("Failed to open store"),
        );
        let objects_dir = TempDir::new().expect("Failed to create objects dir");
        let objects = Arc::new(FlakyStorage::new(LocalObjectStorage::new(objects_dir.path())));

        Self {
            _db_file: db_file,
            store: Arc::new(FlakyStore::new(sqlite.clone())),
            sqlite,
            objects_dir,
            objects,
            presence: PresenceHub::default(),
            config: ChatConfig::default(),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends::new(self.store.clone(), self.objects.clone(), self.presence.clone())
            .with_probe(Arc::new(AlwaysReachable))
    }

    pub async fn session(&self, me: &str) -> (ChatSession, UnboundedReceiver<SessionEvent>) {
        ChatSession::start(me, self.config.clone(), self.backends())
            .await
            .expect("Failed to start session")
    }

    /// Number of live change-feed subscriptions
    pub fn feed_subscribers(&self) -> usize {
        self.sqlite.feed().receiver_count()
    }
}

/// Everything queued on a session's event receiver
pub fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        drained.push(event);
    }
    drained
}

pub fn notices(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Notice(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
    });
    let path = dir.join(name);
    img.save(&path).expect("Failed to write test image");
    path
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn check(&self, _url: &Url) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NeverReachable;

#[async_trait]
impl ReachabilityProbe for NeverReachable {
    async fn check(&self, url: &Url) -> anyhow::Result<()> {
        anyhow::bail!("404 for {}", url)
    }
}

/// `ChatStore` wrapper that can fail chosen operations and counts batch reads
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    pub fail_reads: AtomicBool,
    pub fail_reactions: AtomicBool,
    pub fail_summary: AtomicBool,
    pub batch_reads: AtomicUsize,
    pub membership_reads: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_reactions: AtomicBool::new(false),
            fail_summary: AtomicBool::new(false),
            batch_reads: AtomicUsize::new(0),
            membership_reads: AtomicUsize::new(0),
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} is down", what)));
        }
        Ok(())
    }

    fn count_batch(&self) -> StoreResult<()> {
        self.batch_reads.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_reads, "reads")
    }

    pub fn reset_counters(&self) {
        self.batch_reads.store(0, Ordering::SeqCst);
        self.membership_reads.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatStore for FlakyStore {
    async fn memberships(&self, user_id: &str) -> StoreResult<Vec<ParticipantRow>> {
        self.membership_reads.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_reads, "reads")?;
        self.inner.memberships(user_id).await
    }

    async fn conversations_by_ids(&self, ids: &[String]) -> StoreResult<Vec<ConversationRow>> {
        self.count_batch()?;
        self.inner.conversations_by_ids(ids).await
    }

    async fn participants_in(
        &self,
        conversation_ids: &[String],
    ) -> StoreResult<Vec<ParticipantRow>> {
        self.count_batch()?;
        self.inner.participants_in(conversation_ids).await
    }

    async fn profiles_by_ids(&self, user_ids: &[String]) -> StoreResult<Vec<ProfileRow>> {
        self.count_batch()?;
        self.inner.profiles_by_ids(user_ids).await
    }

    async fn insert_conversation(&self) -> StoreResult<ConversationRow> {
        self.inner.insert_conversation().await
    }

    async fn insert_participants(
        &self,
        conversation_id: &str,
        user_ids: &[String],
    ) -> StoreResult<Vec<ParticipantRow>> {
        self.inner.insert_participants(conversation_id, user_ids).await
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: &str,
        preview: &str,
        sender_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        Self::check(&self.fail_summary, "summary")?;
        self.inner
            .update_conversation_summary(conversation_id, preview, sender_id, at)
            .await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> StoreResult<()> {
        self.inner.delete_conversation(conversation_id).await
    }

    async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.set_last_read(conversation_id, user_id, at).await
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<MessageRow> {
        self.inner.insert_message(message).await
    }

    async fn messages_in(&self, conversation_id: &str) -> StoreResult<Vec<MessageRow>> {
        self.inner.messages_in(conversation_id).await
    }

    async fn soft_delete_message(&self, message_id: &str, sender_id: &str) -> StoreResult<u64> {
        self.inner.soft_delete_message(message_id, sender_id).await
    }

    async fn reactions_for(&self, message_ids: &[String]) -> StoreResult<Vec<ReactionRow>> {
        self.inner.reactions_for(message_ids).await
    }

    async fn insert_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<ReactionRow> {
        Self::check(&self.fail_reactions, "reactions")?;
        self.inner.insert_reaction(message_id, user_id, emoji).await
    }

    async fn update_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> StoreResult<()> {
        Self::check(&self.fail_reactions, "reactions")?;
        self.inner.update_reaction(message_id, user_id, emoji).await
    }

    async fn delete_reaction(&self, message_id: &str, user_id: &str) -> StoreResult<()> {
        Self::check(&self.fail_reactions, "reactions")?;
        self.inner.delete_reaction(message_id, user_id).await
    }

    async fn upsert_profile(&self, profile: ProfileRow) -> StoreResult<()> {
        self.inner.upsert_profile(profile).await
    }

    fn subscribe(&self, filter: FeedFilter) -> Subscription {
        self.inner.subscribe(filter)
    }
}

/// `ObjectStorage` wrapper that can hang uploads or refuse to resolve URLs
pub struct FlakyStorage {
    inner: LocalObjectStorage,
    pub hang_uploads: AtomicUsize,
    pub unresolvable: AtomicBool,
    pub uploads: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(inner: LocalObjectStorage) -> Self {
        Self {
            inner,
            hang_uploads: AtomicUsize::new(0),
            unresolvable: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for FlakyStorage {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> StoreResult<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let hang = self
            .hang_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hang {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.upload(path, bytes, content_type).await
    }

    fn public_url(&self, path: &str) -> StoreResult<Url> {
        if self.unresolvable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("no public URL".into()));
        }
        self.inner.public_url(path)
    }
}
