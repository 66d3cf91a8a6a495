//! End-to-end behaviour of the channel session manager against fake transports

mod common;

use common::{server_message, settle, wait_for, FakeRefresher, Harness, SendScript};
use marketplace_chat_sync::chat::{
    ConnectionState, ConversationKind, ConversationRef, ConversationState, ConversationStatus,
    DeliveryStatus, EventDisposition, OutgoingMessage,
};
use marketplace_chat_sync::transport::{ChannelEvent, TransportEvent};
use marketplace_chat_sync::SyncError;
use std::sync::atomic::Ordering;
use std::time::Duration;

const T0: i64 = 1_730_361_600_000;

fn peer(id: &str) -> ConversationRef {
    ConversationRef::new(ConversationKind::Peer, id)
}

fn ids(snapshot: &marketplace_chat_sync::TimelineSnapshot) -> Vec<String> {
    snapshot.messages.iter().map(|m| m.id.clone()).collect()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_select_renders_history_and_live_messages() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.set_history(
        "42",
        vec![
            server_message("b", "me", "hi", T0 + 1_000),
            server_message("a", "them", "hello", T0),
        ],
    );
    let mut updates = h.manager.subscribe();

    h.manager.select(peer("42")).await.unwrap();
    let snapshot = wait_for(&mut updates, |s| s.messages.len() == 2).await;
    assert_eq!(ids(&snapshot), vec!["a", "b"]);
    assert_eq!(snapshot.connection, ConnectionState::Connecting);
    assert_eq!(snapshot.messages[1].delivery_status, Some(DeliveryStatus::Sent));

    let live = h.transport.latest();
    live.send(TransportEvent::Connected).await.unwrap();
    live.send(TransportEvent::Channel(ChannelEvent::Message(server_message(
        "c",
        "them",
        "anyone there?",
        T0 + 2_000,
    ))))
    .await
    .unwrap();

    let snapshot = wait_for(&mut updates, |s| s.messages.len() == 3).await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(ids(&snapshot), vec!["a", "b", "c"]);

    settle().await;
    assert_eq!(h.api.mark_read_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_history_of_previous_conversation_is_discarded() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.set_history("A", vec![server_message("a1", "them", "from A", T0)]);
    h.api.delay_history("A", Duration::from_millis(200));
    h.api.set_history("B", vec![server_message("b1", "them", "from B", T0)]);

    let manager = h.manager.clone();
    let first = tokio::spawn(async move { manager.select(peer("A")).await });
    settle().await;

    h.manager.select(peer("B")).await.unwrap();
    first.await.unwrap().unwrap();

    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.conversation, Some(peer("B")));
    assert_eq!(ids(&snapshot), vec!["b1"]);
}

#[tokio::test]
async fn test_events_from_superseded_session_are_stale() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("A")).await.unwrap();
    let tag_a = h.manager.active_tag().await.unwrap();

    h.manager.select(peer("B")).await.unwrap();
    let late = TransportEvent::Channel(ChannelEvent::Message(server_message(
        "late",
        "them",
        "for A",
        T0,
    )));
    assert_eq!(
        h.manager.deliver(&tag_a, late.clone()).await,
        EventDisposition::Stale
    );
    let _ = h.transport.channel(0).send(late).await;
    settle().await;

    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.conversation, Some(peer("B")));
    assert!(snapshot.messages.is_empty());
}

#[tokio::test]
async fn test_selecting_active_conversation_is_noop() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();
    let tag = h.manager.active_tag().await.unwrap();

    h.manager.select(peer("42")).await.unwrap();

    assert_eq!(h.manager.active_tag().await, Some(tag));
    assert_eq!(h.transport.subscriptions(), 1);
    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_renders_placeholder_then_confirms_once() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    let temp_id = h.manager.send(OutgoingMessage::text("hello")).await.unwrap();
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].temp_id.as_deref(), Some(temp_id.as_str()));
    assert_eq!(snapshot.messages[0].delivery_status, Some(DeliveryStatus::Sending));

    let snapshot = wait_for(&mut updates, |s| {
        s.messages.len() == 1 && s.messages[0].id == "srv-1"
    })
    .await;
    assert!(snapshot.messages[0].temp_id.is_none());
    assert_eq!(snapshot.messages[0].delivery_status, Some(DeliveryStatus::Sent));

    settle().await;
    assert_eq!(ids(&h.manager.snapshot()), vec!["srv-1"]);
}

#[tokio::test]
async fn test_live_echo_before_ack_is_not_duplicated() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.delay_sends(Duration::from_millis(150));
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    h.manager.send(OutgoingMessage::text("hello")).await.unwrap();
    h.transport
        .latest()
        .send(TransportEvent::Channel(ChannelEvent::Message(server_message(
            "srv-1",
            "me",
            "hello",
            common::now_ms(),
        ))))
        .await
        .unwrap();

    let snapshot = wait_for(&mut updates, |s| {
        s.messages.len() == 1 && s.messages[0].temp_id.is_none()
    })
    .await;
    assert_eq!(snapshot.messages[0].id, "srv-1");

    // Ack and history reconcile arrive afterwards
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ids(&h.manager.snapshot()), vec!["srv-1"]);
}

#[tokio::test]
async fn test_failed_send_can_be_retried() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.script(SendScript::Fail("connection reset".to_string()));
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    let temp_id = h.manager.send(OutgoingMessage::text("hello")).await.unwrap();
    wait_for(&mut updates, |s| {
        s.messages.len() == 1 && s.messages[0].delivery_status == Some(DeliveryStatus::Failed)
    })
    .await;

    let retried = h.manager.retry(&temp_id).await.unwrap();
    assert_ne!(retried, temp_id);

    let snapshot = wait_for(&mut updates, |s| {
        s.messages.len() == 1 && s.messages[0].id == "srv-1"
    })
    .await;
    assert_eq!(snapshot.messages[0].delivery_status, Some(DeliveryStatus::Sent));
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_discard_removes_failed_placeholder() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.script(SendScript::Reject("message too long".to_string()));
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    let temp_id = h.manager.send(OutgoingMessage::text("hello")).await.unwrap();
    wait_for(&mut updates, |s| {
        s.messages.first().and_then(|m| m.delivery_status) == Some(DeliveryStatus::Failed)
    })
    .await;

    h.manager.discard(&temp_id).await.unwrap();
    assert!(h.manager.snapshot().messages.is_empty());
}

#[tokio::test]
async fn test_auth_failure_refreshes_reconnects_and_retries_once() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();
    h.api.accept_only("fresh");
    let mut updates = h.manager.subscribe();

    h.manager.send(OutgoingMessage::text("hello")).await.unwrap();

    let snapshot = wait_for(&mut updates, |s| {
        s.messages.len() == 1 && s.messages[0].id == "srv-1"
    })
    .await;
    assert_eq!(snapshot.messages[0].delivery_status, Some(DeliveryStatus::Sent));
    assert!(!snapshot.session_expired);

    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.subscriptions(), 2);
    assert_eq!(
        *h.api.sent_tokens.lock().unwrap(),
        vec!["stale".to_string(), "fresh".to_string()]
    );
    assert_eq!(
        h.credentials.current().await.unwrap().credential.token(),
        "fresh"
    );
}

#[tokio::test]
async fn test_concurrent_auth_failures_share_one_refresh() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();
    h.api.accept_only("fresh");
    let mut updates = h.manager.subscribe();

    h.manager.send(OutgoingMessage::text("one")).await.unwrap();
    h.manager.send(OutgoingMessage::text("two")).await.unwrap();

    wait_for(&mut updates, |s| {
        s.messages.len() == 2
            && s.messages
                .iter()
                .all(|m| m.temp_id.is_none() && m.delivery_status == Some(DeliveryStatus::Sent))
    })
    .await;
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refresh_failure_expires_session() {
    let h = Harness::new(FakeRefresher::failing());
    h.manager.select(peer("42")).await.unwrap();
    h.api.accept_only("fresh");
    let mut updates = h.manager.subscribe();

    h.manager.send(OutgoingMessage::text("hello")).await.unwrap();

    let snapshot = wait_for(&mut updates, |s| s.session_expired).await;
    assert_eq!(snapshot.connection, ConnectionState::Closed);
    assert_eq!(snapshot.messages[0].delivery_status, Some(DeliveryStatus::Failed));

    let again = h.manager.send(OutgoingMessage::text("still there?")).await;
    assert!(matches!(again, Err(SyncError::SessionExpired)));

    settle().await;
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_live_auth_rejection_resubscribes_with_fresh_credential() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();

    h.transport
        .latest()
        .send(TransportEvent::AuthRejected {
            reason: "jwt expired".to_string(),
        })
        .await
        .unwrap();

    let transport = h.transport.clone();
    wait_until(move || transport.subscriptions() == 2).await;
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.credentials.current().await.unwrap().credential.token(),
        "fresh"
    );
}

#[tokio::test]
async fn test_disconnect_degrades_but_keeps_history_and_sends() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.set_history("42", vec![server_message("a", "them", "hello", T0)]);
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    let live = h.transport.latest();
    live.send(TransportEvent::Connected).await.unwrap();
    live.send(TransportEvent::Disconnected {
        reason: "connection reset".to_string(),
    })
    .await
    .unwrap();

    let snapshot = wait_for(&mut updates, |s| s.connection == ConnectionState::Degraded).await;
    assert_eq!(ids(&snapshot), vec!["a"]);

    h.manager.send(OutgoingMessage::text("still works")).await.unwrap();
    wait_for(&mut updates, |s| s.messages.iter().any(|m| m.id == "srv-1")).await;
}

#[tokio::test]
async fn test_receipts_and_status_updates() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    h.manager.send(OutgoingMessage::text("hello")).await.unwrap();
    wait_for(&mut updates, |s| s.messages.iter().any(|m| m.id == "srv-1")).await;

    let live = h.transport.latest();
    live.send(TransportEvent::Channel(ChannelEvent::Receipt {
        message_id: "srv-1".to_string(),
        status: DeliveryStatus::Read,
    }))
    .await
    .unwrap();
    live.send(TransportEvent::Channel(ChannelEvent::Status(ConversationStatus {
        state: ConversationState::Resolved,
        unread_count: 0,
    })))
    .await
    .unwrap();

    let snapshot = wait_for(&mut updates, |s| s.status.is_some()).await;
    assert_eq!(snapshot.messages[0].delivery_status, Some(DeliveryStatus::Read));
    assert_eq!(
        snapshot.status.map(|s| s.state),
        Some(ConversationState::Resolved)
    );
}

#[tokio::test]
async fn test_close_resets_snapshot() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.set_history("42", vec![server_message("a", "them", "hello", T0)]);
    h.manager.select(peer("42")).await.unwrap();

    h.manager.close().await;

    let snapshot = h.manager.snapshot();
    assert!(snapshot.conversation.is_none());
    assert!(snapshot.messages.is_empty());
    assert!(h.manager.active_tag().await.is_none());
    assert!(matches!(
        h.manager.send(OutgoingMessage::text("nobody")).await,
        Err(SyncError::NoActiveConversation)
    ));
}

#[tokio::test]
async fn test_rejected_refreshed_credential_expires_instead_of_looping() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.accept_only("never-valid");
    let mut updates = h.manager.subscribe();

    h.manager.select(peer("42")).await.unwrap();

    let snapshot = wait_for(&mut updates, |s| s.session_expired).await;
    assert_eq!(snapshot.connection, ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.subscriptions(), 2);
}

#[tokio::test]
async fn test_reselect_reopens_after_channel_gives_up() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.set_history("42", vec![server_message("a", "them", "hello", T0)]);
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    let live = h.transport.latest();
    live.send(TransportEvent::Connected).await.unwrap();
    live.send(TransportEvent::Exhausted).await.unwrap();
    wait_for(&mut updates, |s| s.connection == ConnectionState::Degraded).await;

    h.manager.select(peer("42")).await.unwrap();

    assert_eq!(h.transport.subscriptions(), 2);
    let snapshot = h.manager.snapshot();
    assert_eq!(snapshot.connection, ConnectionState::Connecting);
    assert_eq!(ids(&snapshot), vec!["a"]);
}

#[tokio::test]
async fn test_reselect_keeps_degraded_channel_that_is_retrying() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.manager.select(peer("42")).await.unwrap();
    let mut updates = h.manager.subscribe();

    h.transport
        .latest()
        .send(TransportEvent::Disconnected {
            reason: "connection reset".to_string(),
        })
        .await
        .unwrap();
    wait_for(&mut updates, |s| s.connection == ConnectionState::Degraded).await;

    h.manager.select(peer("42")).await.unwrap();
    assert_eq!(h.transport.subscriptions(), 1);
}

#[tokio::test]
async fn test_mark_read_waits_for_history() {
    let h = Harness::new(FakeRefresher::succeeding("fresh"));
    h.api.delay_history("42", Duration::from_millis(200));

    let manager = h.manager.clone();
    let selecting = tokio::spawn(async move { manager.select(peer("42")).await });
    settle().await;

    h.manager.send(OutgoingMessage::text("early")).await.unwrap();
    settle().await;
    assert_eq!(h.api.mark_read_calls.load(Ordering::SeqCst), 0);

    selecting.await.unwrap().unwrap();
    let api = h.api.clone();
    wait_until(move || api.mark_read_calls.load(Ordering::SeqCst) == 1).await;
}
