//! End-to-end tests of `RelayChannel` against a real `chatline-relay` hub.
//!
//! Each test starts a hub on an ephemeral port and connects participants
//! over WebSocket, exercising registration, live delivery between two
//! sessions, and the hub's identity enforcement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatline::channel::relay::{ChannelConfig, RelayChannel};
use chatline::channel::{ChannelError, PushChannel};
use chatline::persistence::memory::InMemoryPersistence;
use chatline::session::{ConversationSession, SessionContext, SessionEvent};
use chatline_proto::frame::{EVENT_MSG_RECEIVE, SendMsg};
use chatline_proto::message::{DeliveryStatus, Direction, ParticipantId};

fn alice() -> ParticipantId {
    ParticipantId::new("alice")
}

fn bob() -> ParticipantId {
    ParticipantId::new("bob")
}

async fn start_hub() -> String {
    let (addr, _handle) = chatline_relay::hub::start_server("127.0.0.1:0")
        .await
        .expect("hub should start");
    format!("ws://{addr}/ws")
}

async fn connect(url: &str, participant: ParticipantId) -> RelayChannel {
    RelayChannel::connect(&ChannelConfig::new(url.to_string(), participant))
        .await
        .expect("should register with hub")
}

async fn wait_for(
    events: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

#[tokio::test]
async fn registers_and_reports_connection() {
    let url = start_hub().await;

    let channel = connect(&url, alice()).await;

    assert!(channel.is_connected());
    assert_eq!(channel.local_id(), &alice());
    assert_eq!(channel.relay_url(), url);
}

#[tokio::test]
async fn blank_participant_is_rejected() {
    let url = start_hub().await;

    let result = RelayChannel::connect(&ChannelConfig::new(url, ParticipantId::new("  "))).await;

    assert!(matches!(result, Err(ChannelError::Rejected(_))));
}

#[tokio::test]
async fn unreachable_hub_is_an_error() {
    let mut config = ChannelConfig::new("ws://127.0.0.1:1/ws".into(), alice());
    config.connect_timeout = Duration::from_secs(2);

    let result = RelayChannel::connect(&config).await;

    assert!(matches!(
        result,
        Err(ChannelError::Io(_) | ChannelError::Timeout)
    ));
}

#[tokio::test]
async fn raw_channels_exchange_messages_with_hub_assigned_sender() {
    let url = start_hub().await;
    let alice_channel = connect(&url, alice()).await;
    let bob_channel = connect(&url, bob()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bob_channel.on(EVENT_MSG_RECEIVE, tx).unwrap();

    alice_channel
        .emit(SendMsg {
            to: bob(),
            from: ParticipantId::new("mallory"),
            body: "over the wire".into(),
        })
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("handler channel closed");
    assert_eq!(received.from, alice());
    assert_eq!(received.body, "over the wire");
}

#[tokio::test]
async fn removed_handler_stops_receiving() {
    let url = start_hub().await;
    let alice_channel = connect(&url, alice()).await;
    let bob_channel = connect(&url, bob()).await;
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    let first = bob_channel.on(EVENT_MSG_RECEIVE, first_tx).unwrap();
    bob_channel.on(EVENT_MSG_RECEIVE, second_tx).unwrap();

    assert!(bob_channel.off(EVENT_MSG_RECEIVE, first));
    alice_channel
        .emit(SendMsg {
            to: bob(),
            from: alice(),
            body: "after off".into(),
        })
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), second_rx.recv())
        .await
        .expect("timed out")
        .expect("handler channel closed");
    assert_eq!(received.body, "after off");
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn two_sessions_chat_through_the_hub() {
    let url = start_hub().await;
    let service = Arc::new(InMemoryPersistence::new());

    let alice_session = ConversationSession::new(
        SessionContext::new(alice()),
        Arc::clone(&service),
        Arc::new(connect(&url, alice()).await),
    );
    let bob_session = ConversationSession::new(
        SessionContext::new(bob()),
        Arc::clone(&service),
        Arc::new(connect(&url, bob()).await),
    );
    let mut alice_events = alice_session.events().unwrap();
    let mut bob_events = bob_session.events().unwrap();

    alice_session.activate(bob()).unwrap();
    bob_session.activate(alice()).unwrap();
    wait_for(&mut alice_events, |e| matches!(e, SessionEvent::HistoryLoaded { .. })).await;
    wait_for(&mut bob_events, |e| matches!(e, SessionEvent::HistoryLoaded { .. })).await;

    let outcome = alice_session.send("hi bob").await.unwrap();
    let received = wait_for(&mut bob_events, |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;

    assert!(matches!(received, SessionEvent::MessageReceived { from, .. } if from == alice()));
    let bob_view = bob_session.snapshot();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].body, "hi bob");
    assert_eq!(bob_view[0].direction, Direction::Inbound);

    let alice_view = alice_session.snapshot();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0].status, DeliveryStatus::Confirmed);
    assert_eq!(alice_view[0].id, Some(outcome.message_id));

    // Persisted history is shared, so a fresh activation sees the message
    // as authored by alice.
    bob_session.activate(alice()).unwrap();
    wait_for(&mut bob_events, |e| matches!(e, SessionEvent::HistoryLoaded { .. })).await;
    let reloaded = bob_session.snapshot();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].direction, Direction::Inbound);
    assert!(reloaded[0].id.is_some());
}

#[tokio::test]
async fn messages_to_offline_participant_are_not_queued() {
    let url = start_hub().await;
    let alice_channel = connect(&url, alice()).await;

    alice_channel
        .emit(SendMsg {
            to: bob(),
            from: alice(),
            body: "nobody home".into(),
        })
        .unwrap();
    // Let the hub route (and drop) the frame before bob connects.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bob_channel = connect(&url, bob()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bob_channel.on(EVENT_MSG_RECEIVE, tx).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(rx.try_recv().is_err());
}
