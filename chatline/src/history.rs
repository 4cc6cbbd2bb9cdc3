//! History loading for a newly activated conversation.
//!
//! [`HistoryLoader::load`] issues one fetch to the persistence service and
//! maps the records into confirmed messages. [`HistoryLoader::spawn`] runs
//! the load in the background and applies the result only through a
//! [`StoreHandle`] bound to the activation it was started for, so a slow
//! fetch for a previous conversation can never populate the current one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;

use chatline_proto::message::{ConversationId, Direction, MessageId, Timestamp};

use crate::message::Message;
use crate::persistence::{FetchError, Persistence};
use crate::session::SessionEvent;
use crate::store::{MessageStore, StoreError, StoreHandle};

/// Fetches and maps a conversation's history.
pub struct HistoryLoader<P> {
    persistence: Arc<P>,
}

impl<P> Clone for HistoryLoader<P> {
    fn clone(&self) -> Self {
        Self {
            persistence: Arc::clone(&self.persistence),
        }
    }
}

impl<P: Persistence + 'static> HistoryLoader<P> {
    /// Create a loader backed by `persistence`.
    #[must_use]
    pub const fn new(persistence: Arc<P>) -> Self {
        Self { persistence }
    }

    /// Fetch the history for `conversation` as ordered, confirmed messages.
    ///
    /// Direction is derived by comparing each record's author with the local
    /// participant. Records with a blank body are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the persistence request fails. No cached or
    /// partial data is returned in that case.
    pub async fn load(&self, conversation: &ConversationId) -> Result<Vec<Message>, FetchError> {
        let fetched_at = Timestamp::now();
        let records = self
            .persistence
            .fetch_history(&conversation.participant, &conversation.peer)
            .await?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            if record.body.trim().is_empty() {
                tracing::warn!(message_id = %record.id, "skipping history record with blank body");
                continue;
            }
            messages.push(Message::from_record(record, &conversation.participant, fetched_at));
        }
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// Load in the background and apply the result to `store`.
    ///
    /// The outcome is reported on `events` unless the activation has been
    /// replaced in the meantime, in which case the result is discarded.
    pub fn spawn(
        &self,
        conversation: ConversationId,
        store: StoreHandle,
        events: mpsc::Sender<SessionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let started = Timestamp::now();
        let loader = self.clone();
        tokio::spawn(async move {
            let peer = conversation.peer.clone();
            match loader.load(&conversation).await {
                Ok(messages) => {
                    let count = messages.len();
                    match store.with(|s| apply_history(s, messages, started)) {
                        None => {
                            tracing::debug!(peer = %peer, "conversation changed, discarding history");
                        }
                        Some(Ok(())) => {
                            tracing::info!(peer = %peer, count, "history loaded");
                            let _ = events.try_send(SessionEvent::HistoryLoaded { peer, count });
                        }
                        Some(Err(e)) => {
                            tracing::warn!(peer = %peer, error = %e, "history could not be applied");
                            let _ = events.try_send(SessionEvent::StoreAnomaly(e));
                        }
                    }
                }
                Err(e) if store.is_current() => {
                    tracing::warn!(peer = %peer, error = %e, "history fetch failed");
                    let _ = events.try_send(SessionEvent::HistoryFailed {
                        peer,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "stale history fetch failed");
                }
            }
        })
    }
}

/// Apply a history snapshot to the activation's store.
///
/// Live events or optimistic sends may have reached the store before the
/// fetch completed. In that case the store is reset and loaded with the
/// history plus the early entries, each placed by timestamp; pending entries
/// keep their local keys so their sends can still resolve.
///
/// An early entry is dropped when the history already holds it: either the
/// same persistence id, or, for a live inbound message, a peer record with
/// the same body written at or after `since` (the start of the fetch). Each
/// such record absorbs at most one live copy.
///
/// # Errors
///
/// Propagates the [`StoreError`] raised by [`MessageStore::load`]; the early
/// entries are restored when that happens.
pub fn apply_history(
    store: &mut MessageStore,
    history: Vec<Message>,
    since: Timestamp,
) -> Result<(), StoreError> {
    if store.is_empty() {
        return store.load(history);
    }

    let early = store.reset();
    tracing::debug!(early = early.len(), "merging entries that arrived before history");

    let known: HashSet<&MessageId> = history.iter().filter_map(|m| m.id.as_ref()).collect();
    let mut recent_inbound: HashMap<&str, usize> = HashMap::new();
    for m in history
        .iter()
        .filter(|m| m.direction == Direction::Inbound && m.timestamp >= since)
    {
        *recent_inbound.entry(m.body.as_str()).or_default() += 1;
    }

    let mut carried = Vec::with_capacity(early.len());
    for m in &early {
        if m.id.as_ref().is_some_and(|id| known.contains(id)) {
            continue;
        }
        if m.id.is_none() && m.direction == Direction::Inbound {
            if let Some(remaining) = recent_inbound.get_mut(m.body.as_str()).filter(|n| **n > 0) {
                *remaining -= 1;
                continue;
            }
        }
        carried.push(m.clone());
    }

    if let Err(e) = store.load(history.into_iter().chain(carried)) {
        store.load(early)?;
        return Err(e);
    }
    Ok(())
}
