//! End-to-end session behavior over the in-process hub and persistence.
//!
//! Covers history loading, send validation, the optimistic
//! pending → confirmed/failed transitions, and live messages interleaving
//! with pending sends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatline::channel::PushChannel;
use chatline::channel::hub::{HubChannel, LocalHub};
use chatline::outbound::SendError;
use chatline::persistence::WriteError;
use chatline::persistence::memory::InMemoryPersistence;
use chatline::session::{ConversationSession, SessionContext, SessionEvent};
use chatline::store::FailurePolicy;
use chatline_proto::frame::SendMsg;
use chatline_proto::message::{
    DeliveryStatus, Direction, MessageId, ParticipantId, Timestamp, ValidationError,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Session = ConversationSession<InMemoryPersistence, HubChannel>;

fn alice() -> ParticipantId {
    ParticipantId::new("alice")
}

fn bob() -> ParticipantId {
    ParticipantId::new("bob")
}

struct Fixture {
    hub: LocalHub,
    service: Arc<InMemoryPersistence>,
    session: Arc<Session>,
    events: mpsc::Receiver<SessionEvent>,
}

fn fixture_with_policy(policy: FailurePolicy) -> Fixture {
    let hub = LocalHub::new();
    let service = Arc::new(InMemoryPersistence::new());
    let context = SessionContext::new(alice()).with_policy(policy);
    let session = Arc::new(ConversationSession::new(
        context,
        Arc::clone(&service),
        Arc::new(hub.connect(alice())),
    ));
    let events = session.events().expect("events taken twice");
    Fixture {
        hub,
        service,
        session,
        events,
    }
}

fn fixture() -> Fixture {
    fixture_with_policy(FailurePolicy::Remove)
}

/// Wait for the first event matching `pred`, skipping others.
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

async fn history_loaded(events: &mut mpsc::Receiver<SessionEvent>) {
    wait_for(events, |e| matches!(e, SessionEvent::HistoryLoaded { .. })).await;
}

/// Yield until `cond` holds, so spawned tasks can reach their await points.
async fn settle(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_maps_own_messages_to_confirmed_outbound() {
    let mut fx = fixture();
    let t0 = Timestamp::from_millis(1_000);
    fx.service.seed(&alice(), &bob(), "hi", Some(t0));

    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].body, "hi");
    assert_eq!(snapshot[0].direction, Direction::Outbound);
    assert_eq!(snapshot[0].status, DeliveryStatus::Confirmed);
    assert_eq!(snapshot[0].timestamp, t0);
}

#[tokio::test]
async fn failed_history_leaves_store_empty_and_reports() {
    let mut fx = fixture();
    fx.service.seed(&bob(), &alice(), "unreachable", None);
    fx.service.set_fail_fetches(true);

    fx.session.activate(bob()).unwrap();
    let event = wait_for(&mut fx.events, |e| matches!(e, SessionEvent::HistoryFailed { .. })).await;

    assert!(matches!(event, SessionEvent::HistoryFailed { peer, .. } if peer == bob()));
    assert!(fx.session.snapshot().is_empty());
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blank_body_is_rejected_without_side_effects() {
    let mut fx = fixture();
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    let result = fx.session.send("   ").await;

    assert_eq!(result, Err(SendError::Validation(ValidationError::EmptyBody)));
    assert!(fx.session.snapshot().is_empty());
    assert_eq!(fx.service.write_count(), 0);
}

#[tokio::test]
async fn send_is_pending_then_confirmed() {
    let mut fx = fixture();
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    let gate = fx.service.hold_write();
    let session = Arc::clone(&fx.session);
    let send = tokio::spawn(async move { session.send("hello").await });

    settle(|| !fx.session.snapshot().is_empty()).await;
    let pending = fx.session.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].body, "hello");
    assert_eq!(pending[0].status, DeliveryStatus::Pending);
    assert!(pending[0].id.is_none());

    gate.release();
    let outcome = send.await.unwrap().unwrap();
    assert_eq!(outcome.message_id, MessageId::new("m1"));

    let confirmed = fx.session.snapshot();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].status, DeliveryStatus::Confirmed);
    assert_eq!(confirmed[0].id, Some(MessageId::new("m1")));
    assert_eq!(confirmed[0].local_key, Some(outcome.local_key));

    let event = wait_for(&mut fx.events, |e| matches!(e, SessionEvent::SendConfirmed { .. })).await;
    assert_eq!(
        event,
        SessionEvent::SendConfirmed {
            local_key: outcome.local_key,
            message_id: MessageId::new("m1"),
        }
    );
}

#[tokio::test]
async fn failed_write_removes_entry_and_surfaces_error() {
    let mut fx = fixture();
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;
    fx.service.set_fail_writes(true);

    let result = fx.session.send("hello").await;

    assert!(matches!(result, Err(SendError::Failed(WriteError::Transport(_)))));
    assert!(fx.session.snapshot().is_empty());
    wait_for(&mut fx.events, |e| matches!(e, SessionEvent::SendFailed { .. })).await;
}

#[tokio::test]
async fn failed_write_is_kept_as_failed_under_mark_policy() {
    let mut fx = fixture_with_policy(FailurePolicy::MarkFailed);
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;
    fx.service.set_fail_writes(true);

    assert!(fx.session.send("hello").await.is_err());

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, DeliveryStatus::Failed);
    assert!(!snapshot[0].is_pending());
}

#[tokio::test]
async fn announcement_reaches_peer_even_when_write_fails() {
    let mut fx = fixture();
    let bob_endpoint = fx.hub.connect(bob());
    let (live_tx, mut live_rx) = mpsc::unbounded_channel();
    bob_endpoint
        .on(chatline_proto::frame::EVENT_MSG_RECEIVE, live_tx)
        .unwrap();

    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;
    fx.service.set_fail_writes(true);

    assert!(fx.session.send("seen but not stored").await.is_err());
    assert_eq!(live_rx.recv().await.unwrap().body, "seen but not stored");
}

#[tokio::test]
async fn pipeline_accepts_next_send_after_each_outcome() {
    let mut fx = fixture();
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    fx.service.set_fail_writes(true);
    assert!(fx.session.send("first").await.is_err());
    fx.service.set_fail_writes(false);
    let second = fx.session.send("second").await.unwrap();
    let third = fx.session.send("third").await.unwrap();

    assert_ne!(second.local_key, third.local_key);
    let bodies: Vec<_> = fx.session.snapshot().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["second", "third"]);
}

#[tokio::test]
async fn concurrent_send_is_busy() {
    let mut fx = fixture();
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    let gate = fx.service.hold_write();
    let session = Arc::clone(&fx.session);
    let first = tokio::spawn(async move { session.send("first").await });
    settle(|| !fx.session.snapshot().is_empty()).await;

    assert_eq!(fx.session.send("second").await, Err(SendError::Busy));

    gate.release();
    assert!(first.await.unwrap().is_ok());
    assert_eq!(fx.session.snapshot().len(), 1);
}

// ---------------------------------------------------------------------------
// Live messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_message_and_pending_send_coexist_in_order() {
    let mut fx = fixture();
    let bob_endpoint = fx.hub.connect(bob());
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    let gate = fx.service.hold_write();
    let session = Arc::clone(&fx.session);
    let send = tokio::spawn(async move { session.send("mine").await });
    settle(|| !fx.session.snapshot().is_empty()).await;

    bob_endpoint
        .emit(SendMsg {
            to: alice(),
            from: bob(),
            body: "yours".into(),
        })
        .unwrap();
    wait_for(&mut fx.events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(snapshot.iter().any(|m| m.body == "mine" && m.is_pending()));
    assert!(
        snapshot
            .iter()
            .any(|m| m.body == "yours" && m.direction == Direction::Inbound)
    );

    gate.release();
    send.await.unwrap().unwrap();
    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().all(|m| m.status == DeliveryStatus::Confirmed));
}

#[tokio::test]
async fn live_messages_arriving_before_history_are_kept() {
    let mut fx = fixture();
    let bob_endpoint = fx.hub.connect(bob());
    fx.service
        .seed(&bob(), &alice(), "old", Some(Timestamp::from_millis(1)));
    let gate = fx.service.hold_history(&bob());

    fx.session.activate(bob()).unwrap();
    bob_endpoint
        .emit(SendMsg {
            to: alice(),
            from: bob(),
            body: "new".into(),
        })
        .unwrap();
    wait_for(&mut fx.events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;

    gate.release();
    history_loaded(&mut fx.events).await;

    let bodies: Vec<_> = fx.session.snapshot().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["old", "new"]);
}

#[tokio::test]
async fn messages_from_other_participants_are_not_shown() {
    let mut fx = fixture();
    let carol = fx.hub.connect(ParticipantId::new("carol"));
    let bob_endpoint = fx.hub.connect(bob());
    fx.session.activate(bob()).unwrap();
    history_loaded(&mut fx.events).await;

    carol
        .emit(SendMsg {
            to: alice(),
            from: ParticipantId::new("carol"),
            body: "psst".into(),
        })
        .unwrap();
    bob_endpoint
        .emit(SendMsg {
            to: alice(),
            from: bob(),
            body: "hey".into(),
        })
        .unwrap();
    wait_for(&mut fx.events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;

    let bodies: Vec<_> = fx.session.snapshot().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["hey"]);
}

#[tokio::test]
async fn burst_from_peer_reaches_store_completely() {
    let fx = fixture();
    let bob_endpoint = fx.hub.connect(bob());
    fx.session.activate(bob()).unwrap();

    for i in 0..100 {
        bob_endpoint
            .emit(SendMsg {
                to: alice(),
                from: bob(),
                body: format!("burst {i}"),
            })
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while fx.session.snapshot().len() < 100 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("burst never fully arrived");

    let bodies: Vec<_> = fx.session.snapshot().into_iter().map(|m| m.body).collect();
    let expected: Vec<_> = (0..100).map(|i| format!("burst {i}")).collect();
    assert_eq!(bodies, expected);
}

#[tokio::test]
async fn live_message_persisted_during_history_fetch_appears_once() {
    let mut fx = fixture();
    let bob_endpoint = fx.hub.connect(bob());
    let gate = fx.service.hold_history(&bob());

    fx.session.activate(bob()).unwrap();
    settle(|| fx.service.fetch_count() == 1).await;

    // Bob announces, then his write lands while our fetch is still held.
    bob_endpoint
        .emit(SendMsg {
            to: alice(),
            from: bob(),
            body: "hey".into(),
        })
        .unwrap();
    let id = fx.service.seed(&bob(), &alice(), "hey", Some(Timestamp::now()));
    wait_for(&mut fx.events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;

    gate.release();
    history_loaded(&mut fx.events).await;

    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].body, "hey");
    assert_eq!(snapshot[0].id, Some(id));
}
