// Tests for sending, receiving, read markers and soft delete across two sessions

mod common;

use async_trait::async_trait;
use common::{drain, ids, notices, Harness};
use foundit_chat::{ChatError, ChatSession, Notifier, SendNotification, SessionEvent};
use foundit_store::ChatStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct RecordingNotifier(mpsc::UnboundedSender<SendNotification>);

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: SendNotification) -> anyhow::Result<()> {
        self.0.send(notification)?;
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _notification: SendNotification) -> anyhow::Result<()> {
        anyhow::bail!("push service unavailable")
    }
}

#[tokio::test]
async fn test_sends_keep_commit_order() {
    let harness = Harness::new().await;
    let (mut alice, _events) = harness.session("alice").await;
    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    alice.open(&id).await.unwrap();

    for i in 0..20 {
        alice.send_text(&id, &format!("message {}", i)).await.unwrap();
    }

    let contents: Vec<&str> = alice.messages().iter().map(|m| m.content.as_str()).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("message {}", i)).collect();
    assert_eq!(contents, expected);

    let stored = harness.sqlite.messages_in(&id).await.unwrap();
    let stored_ids: Vec<&str> = stored.iter().map(|m| m.id.as_str()).collect();
    let local_ids: Vec<&str> = alice.messages().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(stored_ids, local_ids);
}

#[tokio::test]
async fn test_blank_text_is_rejected_before_the_store() {
    let harness = Harness::new().await;
    let (mut alice, mut events) = harness.session("alice").await;
    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    drain(&mut events);

    let result = alice.send_text(&id, "   \n\t ").await;
    assert!(matches!(result, Err(ChatError::Validation(_))));
    assert!(harness.sqlite.messages_in(&id).await.unwrap().is_empty());

    let notices = notices(&drain(&mut events));
    assert_eq!(notices, vec!["Message cannot be empty".to_string()]);
}

#[tokio::test]
async fn test_preview_is_truncated_to_one_hundred_chars() {
    let harness = Harness::new().await;
    let (mut alice, _events) = harness.session("alice").await;
    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();

    let long = "found near the library ".repeat(10);
    let message = alice.send_text(&id, &long).await.unwrap();
    assert_eq!(message.content, long);

    let conversation = alice.conversation(&id).unwrap();
    let preview = conversation.last_message.as_deref().unwrap();
    assert!(preview.ends_with("..."));
    assert_eq!(preview.chars().count(), 103);
    assert_eq!(conversation.last_message_sender_id.as_deref(), Some("alice"));
    assert!(!conversation.unread);
}

#[tokio::test]
async fn test_received_message_appears_once_and_is_marked_read() {
    let harness = Harness::new().await;
    let (mut alice, _alice_events) = harness.session("alice").await;
    let (mut bob, mut bob_events) = harness.session("bob").await;

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    alice.open(&id).await.unwrap();
    bob.process_pending().await.unwrap();
    bob.open(&id).await.unwrap();
    drain(&mut bob_events);

    let sent = alice.send_text(&id, "Your keys are with me").await.unwrap();
    assert_eq!(alice.messages().len(), 1);

    // Own message is filtered out of alice's feed
    alice.process_pending().await.unwrap();
    assert_eq!(alice.messages().len(), 1);

    bob.process_pending().await.unwrap();
    assert_eq!(bob.messages().len(), 1);
    assert_eq!(bob.messages()[0].id, sent.id);
    assert!(drain(&mut bob_events).contains(&SessionEvent::MessagesChanged));

    let conversation = bob.conversation(&id).unwrap();
    assert!(!conversation.unread);
    assert!(conversation.my_last_read_at.unwrap() >= sent.created_at);

    // Processing again is a no-op
    bob.process_pending().await.unwrap();
    assert_eq!(bob.messages().len(), 1);
}

#[tokio::test]
async fn test_messages_for_other_conversations_are_ignored() {
    let harness = Harness::new().await;
    let (mut alice, _alice_events) = harness.session("alice").await;
    let (mut bob, _bob_events) = harness.session("bob").await;

    let with_bob = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    let group = alice
        .create_or_get_conversation(&ids(&["bob", "carol"]))
        .await
        .unwrap();
    bob.process_pending().await.unwrap();
    bob.open(&with_bob).await.unwrap();

    alice.send_text(&group, "Anyone lost a scarf?").await.unwrap();
    bob.process_pending().await.unwrap();

    assert!(bob.messages().is_empty());
    assert!(bob.conversation(&group).unwrap().unread);
    assert!(!bob.conversation(&with_bob).unwrap().unread);
}

#[tokio::test]
async fn test_seen_by_others_follows_read_markers() {
    let harness = Harness::new().await;
    let (mut alice, mut alice_events) = harness.session("alice").await;
    let (mut bob, _bob_events) = harness.session("bob").await;

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    alice.open(&id).await.unwrap();
    let first = alice.send_text(&id, "Is this your wallet?").await.unwrap();
    assert!(!alice.is_seen_by_others(&first.id));

    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.process_pending().await.unwrap();
    bob.open(&id).await.unwrap();

    drain(&mut alice_events);
    alice.process_pending().await.unwrap();
    assert!(alice.is_seen_by_others(&first.id));
    assert!(drain(&mut alice_events).contains(&SessionEvent::ReadMapChanged));
    assert!(alice.read_map().unwrap().last_read("bob").is_some());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = alice.send_text(&id, "It has a red tag").await.unwrap();
    alice.process_pending().await.unwrap();
    assert!(alice.is_seen_by_others(&first.id));
    assert!(!alice.is_seen_by_others(&second.id));

    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.process_pending().await.unwrap();
    alice.process_pending().await.unwrap();
    assert!(alice.is_seen_by_others(&first.id));
    assert!(alice.is_seen_by_others(&second.id));
}

#[tokio::test]
async fn test_soft_delete_is_scoped_to_the_sender() {
    let harness = Harness::new().await;
    let (mut alice, _alice_events) = harness.session("alice").await;
    let (mut bob, mut bob_events) = harness.session("bob").await;

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    alice.open(&id).await.unwrap();
    let mine = alice.send_text(&id, "Found a phone").await.unwrap();
    let typo = alice.send_text(&id, "Found a phnoe").await.unwrap();

    bob.process_pending().await.unwrap();
    bob.open(&id).await.unwrap();
    assert_eq!(bob.messages().len(), 2);
    drain(&mut bob_events);

    // Not bob's message: nothing changes and nothing is announced
    assert!(!bob.delete_message(&mine.id).await.unwrap());
    assert!(!bob.delete_message("no-such-message").await.unwrap());
    assert!(notices(&drain(&mut bob_events)).is_empty());
    assert_eq!(harness.sqlite.messages_in(&id).await.unwrap().len(), 2);

    assert!(alice.delete_message(&typo.id).await.unwrap());
    assert_eq!(alice.messages().len(), 1);
    assert_eq!(harness.sqlite.messages_in(&id).await.unwrap().len(), 1);

    bob.process_pending().await.unwrap();
    let remaining: Vec<&str> = bob.messages().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(remaining, vec![mine.id.as_str()]);
}

#[tokio::test]
async fn test_summary_failure_does_not_fail_the_send() {
    let harness = Harness::new().await;
    let (mut alice, mut events) = harness.session("alice").await;
    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    alice.open(&id).await.unwrap();
    drain(&mut events);

    harness.store.fail_summary.store(true, Ordering::SeqCst);
    let sent = alice.send_text(&id, "See you at the lost and found").await;
    assert!(sent.is_ok());
    assert_eq!(alice.messages().len(), 1);
    assert!(notices(&drain(&mut events)).is_empty());
    assert!(alice.conversation(&id).unwrap().last_message.is_none());
}

#[tokio::test]
async fn test_notification_reaches_other_participants() {
    let harness = Harness::new().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let backends = harness
        .backends()
        .with_notifier(Arc::new(RecordingNotifier(tx)));
    let (mut alice, _events) = ChatSession::start("alice", harness.config.clone(), backends)
        .await
        .unwrap();

    let id = alice
        .create_or_get_conversation(&ids(&["bob", "carol"]))
        .await
        .unwrap();
    let sent = alice.send_text(&id, "Who owns the green umbrella?").await.unwrap();

    let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("No notification dispatched")
        .unwrap();
    assert_eq!(notification.message_id, sent.id);
    assert_eq!(notification.sender_id, "alice");
    let mut recipients = notification.recipients.clone();
    recipients.sort();
    assert_eq!(recipients, ids(&["bob", "carol"]));
    assert_eq!(notification.preview, "Who owns the green umbrella?");
}

#[tokio::test]
async fn test_notification_failure_is_not_surfaced() {
    let harness = Harness::new().await;
    let backends = harness.backends().with_notifier(Arc::new(FailingNotifier));
    let (mut alice, mut events) = ChatSession::start("alice", harness.config.clone(), backends)
        .await
        .unwrap();

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    drain(&mut events);
    alice.send_text(&id, "Ping").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(notices(&drain(&mut events)).is_empty());
}

#[tokio::test]
async fn test_lagging_subscriber_reloads_instead_of_losing_messages() {
    let harness = Harness::with_store_config(|config| config.feed_capacity = 4).await;
    let (mut alice, _alice_events) = harness.session("alice").await;
    let (mut bob, _bob_events) = harness.session("bob").await;

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    bob.process_pending().await.unwrap();
    bob.open(&id).await.unwrap();

    for i in 0..12 {
        alice.send_text(&id, &format!("burst {}", i)).await.unwrap();
    }
    bob.process_pending().await.unwrap();

    let contents: Vec<String> = bob.messages().iter().map(|m| m.content.clone()).collect();
    let expected: Vec<String> = (0..12).map(|i| format!("burst {}", i)).collect();
    assert_eq!(contents, expected);
    assert_eq!(bob.conversation(&id).unwrap().last_message.as_deref(), Some("burst 11"));
}

#[tokio::test]
async fn test_next_update_applies_a_remote_message() {
    let harness = Harness::new().await;
    let (mut alice, _alice_events) = harness.session("alice").await;
    let (mut bob, _bob_events) = harness.session("bob").await;

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    bob.process_pending().await.unwrap();
    bob.open(&id).await.unwrap();

    alice.send_text(&id, "Meet at the front gate").await.unwrap();
    while bob.messages().is_empty() {
        tokio::time::timeout(Duration::from_secs(5), bob.next_update())
            .await
            .expect("Timed out waiting for the message")
            .unwrap();
    }
    assert_eq!(bob.messages()[0].content, "Meet at the front gate");
}

#[tokio::test]
async fn test_select_loop_marks_every_remote_message_read() {
    use futures::StreamExt;

    let harness = Harness::new().await;
    let (mut alice, mut alice_events) = harness.session("alice").await;
    let (mut bob, _bob_events) = harness.session("bob").await;

    let id = alice
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    alice.open(&id).await.unwrap();
    drain(&mut alice_events);

    for i in 0..20 {
        let sent = bob.send_text(&id, &format!("clue {}", i)).await.unwrap();

        // Session events become ready while a change is being applied
        tokio::time::timeout(Duration::from_secs(5), async {
            while alice.messages().len() < i + 1 {
                tokio::select! {
                    incoming = alice.recv_update() => alice.apply_update(incoming).await.unwrap(),
                    Some(_) = alice_events.next() => {}
                }
            }
        })
        .await
        .expect("Timed out waiting for the message");

        let participants = harness.sqlite.participants_in(&[id.clone()]).await.unwrap();
        let mine = participants.iter().find(|p| p.user_id == "alice").unwrap();
        assert!(mine.last_read_at.unwrap() >= sent.created_at, "message {} left unread", i);
        assert!(!alice.conversation(&id).unwrap().unread);
    }
}
