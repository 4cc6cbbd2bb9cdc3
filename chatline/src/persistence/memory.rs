//! In-process persistence service.
//!
//! Keeps one record log per unordered participant pair, the way the history
//! API groups messages by the two users involved. Supports failure injection
//! and gates that hold a request in flight until released, so tests can
//! reproduce slow fetches and concurrent sends deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use chatline_proto::message::{MessageId, ParticipantId, Timestamp};
use chatline_proto::record::{HistoryRecord, WriteReceipt};

use super::{FetchError, Persistence, WriteError};

type ThreadKey = (ParticipantId, ParticipantId);

fn thread_key(a: &ParticipantId, b: &ParticipantId) -> ThreadKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Holds a request in flight until released or dropped.
#[derive(Debug)]
pub struct Gate(oneshot::Sender<()>);

impl Gate {
    /// Lets the held request proceed.
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

/// In-memory implementation of [`Persistence`].
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    threads: Mutex<HashMap<ThreadKey, Vec<HistoryRecord>>>,
    next_id: AtomicU64,
    fail_fetches: AtomicBool,
    fail_writes: AtomicBool,
    /// Pending fetch gates, keyed by the requested peer.
    fetch_gates: Mutex<HashMap<ParticipantId, oneshot::Receiver<()>>>,
    write_gate: Mutex<Option<oneshot::Receiver<()>>>,
    latency: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryPersistence {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record directly, bypassing failure injection and gates.
    pub fn seed(
        &self,
        author: &ParticipantId,
        recipient: &ParticipantId,
        body: &str,
        created_at: Option<Timestamp>,
    ) -> MessageId {
        let id = self.allocate_id();
        self.threads
            .lock()
            .entry(thread_key(author, recipient))
            .or_default()
            .push(HistoryRecord {
                id: id.clone(),
                author: author.clone(),
                body: body.to_string(),
                created_at,
            });
        id
    }

    /// All records stored between `a` and `b`, oldest first.
    #[must_use]
    pub fn records(&self, a: &ParticipantId, b: &ParticipantId) -> Vec<HistoryRecord> {
        self.threads
            .lock()
            .get(&thread_key(a, b))
            .cloned()
            .unwrap_or_default()
    }

    /// Make subsequent fetches fail (or succeed again).
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every fetch and write by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Hold the next history fetch for `peer` until the gate is released.
    pub fn hold_history(&self, peer: &ParticipantId) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.fetch_gates.lock().insert(peer.clone(), rx);
        Gate(tx)
    }

    /// Hold the next write until the gate is released.
    pub fn hold_write(&self) -> Gate {
        let (tx, rx) = oneshot::channel();
        *self.write_gate.lock() = Some(rx);
        Gate(tx)
    }

    /// Number of history fetches received.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of writes received.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn allocate_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        MessageId::new(format!("m{n}"))
    }
}

impl Persistence for InMemoryPersistence {
    async fn fetch_history(
        &self,
        participant: &ParticipantId,
        peer: &ParticipantId,
    ) -> Result<Vec<HistoryRecord>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gates.lock().remove(peer);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.simulate_latency().await;

        if self.fail_fetches.load(Ordering::SeqCst) {
            tracing::debug!(participant = %participant, peer = %peer, "injected fetch failure");
            return Err(FetchError::Transport("history service unavailable".into()));
        }
        Ok(self.records(participant, peer))
    }

    async fn write_message(
        &self,
        participant: &ParticipantId,
        peer: &ParticipantId,
        body: &str,
    ) -> Result<WriteReceipt, WriteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let gate = self.write_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.simulate_latency().await;

        if self.fail_writes.load(Ordering::SeqCst) {
            tracing::debug!(participant = %participant, peer = %peer, "injected write failure");
            return Err(WriteError::Transport("message service unavailable".into()));
        }
        let id = self.seed(participant, peer, body, Some(Timestamp::now()));
        Ok(WriteReceipt { id })
    }
}
