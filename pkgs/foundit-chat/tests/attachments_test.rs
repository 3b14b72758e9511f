// Tests for image sends through compression, upload, URL resolution and probing

mod common;

use common::{drain, ids, notices, write_png, Harness, NeverReachable};
use foundit_chat::{ChatError, ChatSession, ImageAttachment};
use foundit_store::{ChatStore, MessageKind};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn conversation_with_bob(session: &mut ChatSession) -> String {
    let id = session
        .create_or_get_conversation(&ids(&["bob"]))
        .await
        .unwrap();
    session.open(&id).await.unwrap();
    id
}

#[tokio::test]
async fn test_batch_is_capped_and_sent_in_order() {
    let harness = Harness::new().await;
    let (mut alice, _events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;

    let dir = TempDir::new().unwrap();
    let paths: Vec<_> = (0..6)
        .map(|i| write_png(dir.path(), &format!("photo-{}.png", i), 40 + i, 30))
        .collect();

    let results = alice.send_images(&id, &paths).await;
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(harness.objects.uploads(), 5);

    let stored = harness.sqlite.messages_in(&id).await.unwrap();
    assert_eq!(stored.len(), 5);
    for (i, message) in stored.iter().enumerate() {
        assert_eq!(message.kind, MessageKind::Image);
        let attachment = ImageAttachment::from_message(message).unwrap();
        assert_eq!(attachment.width, 40 + i as u32);
        assert_eq!(attachment.content_type, "image/jpeg");

        let url = url::Url::parse(&attachment.url).unwrap();
        let file = url.to_file_path().unwrap();
        assert!(file.exists());
    }

    assert_eq!(alice.messages().len(), 5);
    assert_eq!(
        alice.conversation(&id).unwrap().last_message.as_deref(),
        Some("📷 Photo")
    );
}

#[tokio::test]
async fn test_large_images_are_downscaled() {
    let harness = Harness::new().await;
    let (mut alice, _events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "tall.png", 600, 2400);
    let message = alice.send_image(&id, &path).await.unwrap();

    let attachment = ImageAttachment::from_message(&message).unwrap();
    assert_eq!((attachment.width, attachment.height), (256, 1024));
    assert!(attachment.size > 0);
}

#[tokio::test]
async fn test_upload_is_retried_once_after_a_timeout() {
    let mut harness = Harness::new().await;
    harness.config.upload_timeout = Duration::from_millis(200);
    let (mut alice, mut events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "slow.png", 32, 32);

    harness.objects.hang_uploads.store(1, Ordering::SeqCst);
    alice.send_image(&id, &path).await.unwrap();
    assert_eq!(harness.objects.uploads(), 2);
    assert_eq!(harness.sqlite.messages_in(&id).await.unwrap().len(), 1);
    assert!(notices(&drain(&mut events)).is_empty());
}

#[tokio::test]
async fn test_upload_gives_up_after_the_retry() {
    let mut harness = Harness::new().await;
    harness.config.upload_timeout = Duration::from_millis(200);
    let (mut alice, mut events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "stuck.png", 32, 32);

    harness.objects.hang_uploads.store(2, Ordering::SeqCst);
    let result = alice.send_image(&id, &path).await;
    assert!(matches!(result, Err(ChatError::UploadTimeout(_))));
    assert_eq!(harness.objects.uploads(), 2);
    assert!(harness.sqlite.messages_in(&id).await.unwrap().is_empty());
    assert!(alice.messages().is_empty());
    assert_eq!(notices(&drain(&mut events)).len(), 1);
}

#[tokio::test]
async fn test_oversized_image_is_rejected_before_upload() {
    let mut harness = Harness::new().await;
    harness.config.max_upload_bytes = 128;
    let (mut alice, mut events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "noisy.png", 256, 256);
    let result = alice.send_image(&id, &path).await;

    assert!(matches!(result, Err(ChatError::TooLarge { limit: 128, .. })));
    assert_eq!(harness.objects.uploads(), 0);
    assert!(harness.sqlite.messages_in(&id).await.unwrap().is_empty());
    assert_eq!(notices(&drain(&mut events)).len(), 1);
}

#[tokio::test]
async fn test_non_images_are_refused() {
    let harness = Harness::new().await;
    let (mut alice, mut events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "not a picture").unwrap();

    let result = alice.send_image(&id, &path).await;
    assert!(matches!(result, Err(ChatError::UnsupportedMediaType(_))));
    assert_eq!(harness.objects.uploads(), 0);
    assert_eq!(
        notices(&drain(&mut events)),
        vec!["Only images can be attached.".to_string()]
    );
}

#[tokio::test]
async fn test_unresolvable_url_fails_the_send() {
    let harness = Harness::new().await;
    let (mut alice, mut events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "lost.png", 32, 32);

    harness.objects.unresolvable.store(true, Ordering::SeqCst);
    let result = alice.send_image(&id, &path).await;
    assert!(matches!(result, Err(ChatError::UnresolvableUrl(_))));
    assert_eq!(harness.objects.uploads(), 1);
    assert!(harness.sqlite.messages_in(&id).await.unwrap().is_empty());
    assert_eq!(notices(&drain(&mut events)).len(), 1);
}

#[tokio::test]
async fn test_unreachable_url_only_warns() {
    let harness = Harness::new().await;
    let backends = harness.backends().with_probe(Arc::new(NeverReachable));
    let (mut alice, mut events) = ChatSession::start("alice", harness.config.clone(), backends)
        .await
        .unwrap();
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "cdn-lag.png", 32, 32);

    let message = alice.send_image(&id, &path).await.unwrap();
    assert!(ImageAttachment::from_message(&message).is_some());
    assert_eq!(harness.sqlite.messages_in(&id).await.unwrap().len(), 1);
    assert!(notices(&drain(&mut events)).is_empty());
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_batch() {
    let harness = Harness::new().await;
    let (mut alice, mut events) = harness.session("alice").await;
    let id = conversation_with_bob(&mut alice).await;
    drain(&mut events);

    let dir = TempDir::new().unwrap();
    let bad = dir.path().join("receipt.pdf");
    std::fs::write(&bad, "%PDF-1.4").unwrap();
    let paths = vec![
        write_png(dir.path(), "front.png", 32, 32),
        bad,
        write_png(dir.path(), "back.png", 32, 32),
    ];

    let results = alice.send_images(&id, &paths).await;
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(ChatError::UnsupportedMediaType(_))));
    assert!(results[2].is_ok());

    assert_eq!(harness.sqlite.messages_in(&id).await.unwrap().len(), 2);
    assert_eq!(notices(&drain(&mut events)).len(), 1);
}

#[tokio::test]
async fn test_received_image_carries_its_attachment() {
    let harness = Harness::new().await;
    let (mut alice, _alice_events) = harness.session("alice").await;
    let (mut bob, _bob_events) = harness.session("bob").await;
    let id = conversation_with_bob(&mut alice).await;
    bob.process_pending().await.unwrap();
    bob.open(&id).await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = write_png(dir.path(), "found.png", 48, 48);
    let sent = alice.send_image(&id, &path).await.unwrap();

    bob.process_pending().await.unwrap();
    assert_eq!(bob.messages().len(), 1);
    let attachment = ImageAttachment::from_message(&bob.messages()[0]).unwrap();
    assert_eq!(
        Some(attachment),
        ImageAttachment::from_message(&sent)
    );
    assert_eq!(
        bob.conversation(&id).unwrap().last_message.as_deref(),
        Some("📷 Photo")
    );
}
