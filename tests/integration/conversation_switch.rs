//! Conversation switching while work for the previous peer is in flight.
//!
//! Late history, late write acknowledgments, and live messages addressed to
//! the previous conversation must never land in the new conversation's
//! store, and the previous inbox handler is detached before the next one
//! is registered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatline::channel::PushChannel;
use chatline::channel::hub::{HubChannel, LocalHub};
use chatline::persistence::memory::InMemoryPersistence;
use chatline::session::{ConversationSession, SessionContext, SessionEvent};
use chatline_proto::frame::SendMsg;
use chatline_proto::message::{DeliveryStatus, ParticipantId, Timestamp};

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

fn carol() -> ParticipantId {
    ParticipantId::new("carol")
}

struct Fixture {
    hub: LocalHub,
    channel: Arc<HubChannel>,
    service: Arc<InMemoryPersistence>,
    session: Arc<Session>,
    events: mpsc::Receiver<SessionEvent>,
}

fn fixture() -> Fixture {
    let hub = LocalHub::new();
    let channel = Arc::new(hub.connect(alice()));
    let service = Arc::new(InMemoryPersistence::new());
    let session = Arc::new(ConversationSession::new(
        SessionContext::new(alice()),
        Arc::clone(&service),
        Arc::clone(&channel),
    ));
    let events = session.events().expect("events taken twice");
    Fixture {
        hub,
        channel,
        service,
        session,
        events,
    }
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

async fn history_loaded_for(events: &mut mpsc::Receiver<SessionEvent>, peer: &ParticipantId) {
    wait_for(
        events,
        |e| matches!(e, SessionEvent::HistoryLoaded { peer: p, .. } if p == peer),
    )
    .await;
}

async fn settle(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

/// Give spawned tasks a chance to run to completion.
async fn drain_tasks() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn bodies(session: &Session) -> Vec<String> {
    session.snapshot().into_iter().map(|m| m.body).collect()
}

// ---------------------------------------------------------------------------
// History races
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_history_for_previous_peer_never_reaches_new_store() {
    let mut fx = fixture();
    fx.service
        .seed(&bob(), &alice(), "from bob", Some(Timestamp::from_millis(1)));
    fx.service
        .seed(&carol(), &alice(), "from carol", Some(Timestamp::from_millis(2)));
    let bob_gate = fx.service.hold_history(&bob());

    fx.session.activate(bob()).unwrap();
    settle(|| fx.service.fetch_count() == 1).await;

    fx.session.activate(carol()).unwrap();
    history_loaded_for(&mut fx.events, &carol()).await;

    bob_gate.release();
    drain_tasks().await;

    assert_eq!(bodies(&fx.session), vec!["from carol"]);
    while let Ok(event) = fx.events.try_recv() {
        assert!(
            !matches!(&event, SessionEvent::HistoryLoaded { peer, .. } if *peer == bob()),
            "stale history event: {event:?}"
        );
    }
}

#[tokio::test]
async fn reactivating_same_peer_fetches_again() {
    let mut fx = fixture();
    fx.service.seed(&bob(), &alice(), "one", None);

    fx.session.activate(bob()).unwrap();
    history_loaded_for(&mut fx.events, &bob()).await;
    fx.session.activate(bob()).unwrap();
    history_loaded_for(&mut fx.events, &bob()).await;

    assert_eq!(fx.service.fetch_count(), 2);
    assert_eq!(bodies(&fx.session), vec!["one"]);
}

// ---------------------------------------------------------------------------
// Live inbox handover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn previous_inbox_is_detached_before_next_subscribes() {
    let mut fx = fixture();
    let bob_endpoint = fx.hub.connect(bob());
    let carol_endpoint = fx.hub.connect(carol());

    fx.session.activate(bob()).unwrap();
    assert_eq!(fx.channel.handler_count(), 1);

    fx.session.activate(carol()).unwrap();
    assert_eq!(fx.channel.handler_count(), 1);
    history_loaded_for(&mut fx.events, &carol()).await;

    bob_endpoint
        .emit(SendMsg {
            to: alice(),
            from: bob(),
            body: "for the old conversation".into(),
        })
        .unwrap();
    carol_endpoint
        .emit(SendMsg {
            to: alice(),
            from: carol(),
            body: "for the new conversation".into(),
        })
        .unwrap();
    let received = wait_for(&mut fx.events, |e| {
        matches!(e, SessionEvent::MessageReceived { .. })
    })
    .await;

    assert!(matches!(received, SessionEvent::MessageReceived { from, .. } if from == carol()));
    assert_eq!(bodies(&fx.session), vec!["for the new conversation"]);
}

#[tokio::test]
async fn deactivate_detaches_inbox_and_clears_store() {
    let mut fx = fixture();
    fx.service.seed(&bob(), &alice(), "hi", None);
    fx.session.activate(bob()).unwrap();
    history_loaded_for(&mut fx.events, &bob()).await;
    assert_eq!(fx.session.snapshot().len(), 1);

    fx.session.deactivate();

    assert_eq!(fx.channel.handler_count(), 0);
    assert!(fx.session.snapshot().is_empty());
    assert!(fx.session.active().is_none());
}

// ---------------------------------------------------------------------------
// Writes crossing a switch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_completing_after_switch_stays_out_of_new_store() {
    let mut fx = fixture();
    fx.session.activate(bob()).unwrap();
    history_loaded_for(&mut fx.events, &bob()).await;

    let gate = fx.service.hold_write();
    let session = Arc::clone(&fx.session);
    let send = tokio::spawn(async move { session.send("to bob").await });
    settle(|| !fx.session.snapshot().is_empty()).await;

    fx.session.activate(carol()).unwrap();
    history_loaded_for(&mut fx.events, &carol()).await;
    assert!(fx.session.snapshot().is_empty());

    gate.release();
    let outcome = send.await.unwrap();

    assert!(outcome.is_ok(), "caller still learns the write succeeded");
    assert!(fx.session.snapshot().is_empty());
    let stored: Vec<_> = fx
        .service
        .records(&alice(), &bob())
        .into_iter()
        .map(|r| r.body)
        .collect();
    assert_eq!(stored, vec!["to bob"]);
}

#[tokio::test]
async fn failed_write_after_switch_does_not_touch_new_store() {
    let mut fx = fixture();
    fx.service.seed(&carol(), &alice(), "carol says hi", None);
    fx.session.activate(bob()).unwrap();
    history_loaded_for(&mut fx.events, &bob()).await;

    fx.service.set_fail_writes(true);
    let gate = fx.service.hold_write();
    let session = Arc::clone(&fx.session);
    let send = tokio::spawn(async move { session.send("lost").await });
    settle(|| !fx.session.snapshot().is_empty()).await;

    fx.session.activate(carol()).unwrap();
    history_loaded_for(&mut fx.events, &carol()).await;
    gate.release();

    assert!(send.await.unwrap().is_err());
    let snapshot = fx.session.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].body, "carol says hi");
    assert_eq!(snapshot[0].status, DeliveryStatus::Confirmed);
}

#[tokio::test]
async fn send_after_switch_targets_new_peer() {
    let mut fx = fixture();
    let carol_endpoint = fx.hub.connect(carol());
    let (live_tx, mut live_rx) = mpsc::unbounded_channel();
    carol_endpoint
        .on(chatline_proto::frame::EVENT_MSG_RECEIVE, live_tx)
        .unwrap();

    fx.session.activate(bob()).unwrap();
    fx.session.activate(carol()).unwrap();
    history_loaded_for(&mut fx.events, &carol()).await;

    fx.session.send("hello carol").await.unwrap();

    let live = live_rx.recv().await.unwrap();
    assert_eq!(live.from, alice());
    assert_eq!(live.body, "hello carol");
    assert_eq!(fx.service.records(&alice(), &carol()).len(), 1);
    assert!(fx.service.records(&alice(), &bob()).is_empty());
}
