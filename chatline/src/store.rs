//! Ordered message store for the active conversation.
//!
//! [`MessageStore`] is plain data with synchronous operations. It keeps
//! messages in non-decreasing timestamp order (ties in insertion order) and
//! holds at most one entry per [`LocalKey`].
//!
//! [`SharedStore`] owns the store of the active conversation together with an
//! activation epoch. Components receive a [`StoreHandle`] bound to the epoch
//! they were started for; once the conversation changes, every mutation
//! through an old handle is refused, so late results never reach the new
//! conversation's store.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use chatline_proto::message::{DeliveryStatus, Direction, MessageId, Timestamp};

use crate::message::{LocalKey, Message};

/// Invariant violations reported by [`MessageStore`].
///
/// These never indicate corrupted state: the offending operation is refused
/// and the store is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The operation does not apply to the store or message in its current state.
    #[error("invalid store state: {0}")]
    InvalidState(&'static str),

    /// An entry with this local key already exists.
    #[error("duplicate local key {0}")]
    DuplicateKey(LocalKey),

    /// No pending entry exists for this local key.
    #[error("no pending entry for {0}")]
    NotFound(LocalKey),
}

/// What happens to an optimistic entry when its send fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Remove the entry; the UI shows no trace of it.
    #[default]
    Remove,
    /// Keep the entry, marked [`DeliveryStatus::Failed`].
    MarkFailed,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remove" => Ok(Self::Remove),
            "mark-failed" => Ok(Self::MarkFailed),
            other => Err(format!(
                "unknown failure policy '{other}' (expected 'remove' or 'mark-failed')"
            )),
        }
    }
}

/// Ordered collection of the active conversation's messages.
#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<Message>,
    policy: FailurePolicy,
}

impl MessageStore {
    /// Creates an empty store with the given failure policy.
    #[must_use]
    pub const fn new(policy: FailurePolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    /// Replaces the (empty) contents with an initial sequence.
    ///
    /// Messages are placed by timestamp, so an unordered input still yields
    /// an ordered store.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidState`] if the store is not empty (call
    /// [`reset`](Self::reset) first), or [`StoreError::DuplicateKey`] if two
    /// initial messages share a local key. The store is unchanged on error.
    pub fn load(&mut self, initial: impl IntoIterator<Item = Message>) -> Result<(), StoreError> {
        if !self.entries.is_empty() {
            return Err(StoreError::InvalidState("load on a non-empty store"));
        }
        let initial: Vec<Message> = initial.into_iter().collect();
        let mut seen = HashSet::new();
        for key in initial.iter().filter_map(|m| m.local_key) {
            if !seen.insert(key) {
                return Err(StoreError::DuplicateKey(key));
            }
        }
        self.entries.reserve(initial.len());
        for msg in initial {
            self.place(msg);
        }
        Ok(())
    }

    /// Empties the store, returning the previous contents in order.
    pub fn reset(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.entries)
    }

    /// Inserts a confirmed message at its position by timestamp.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidState`] if the message is not confirmed, or
    /// [`StoreError::DuplicateKey`] if its local key is already present.
    pub fn append_confirmed(&mut self, msg: Message) -> Result<(), StoreError> {
        if msg.status != DeliveryStatus::Confirmed {
            return Err(StoreError::InvalidState("append_confirmed needs a confirmed message"));
        }
        if let Some(key) = msg.local_key {
            self.ensure_absent(key)?;
        }
        self.place(msg);
        Ok(())
    }

    /// Inserts an optimistic outbound entry keyed by its local key.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidState`] if the message is not an outbound pending
    /// entry with a local key, or [`StoreError::DuplicateKey`] on collision.
    pub fn insert_pending(&mut self, msg: Message) -> Result<(), StoreError> {
        let Some(key) = msg.local_key else {
            return Err(StoreError::InvalidState("pending message without a local key"));
        };
        if msg.direction != Direction::Outbound || !msg.is_pending() {
            return Err(StoreError::InvalidState("insert_pending needs an outbound pending message"));
        }
        self.ensure_absent(key)?;
        self.place(msg);
        Ok(())
    }

    /// Confirms the pending entry for `key`, attaching the persistence id.
    ///
    /// Any other entry already carrying `confirmed_id` (a history copy of
    /// the same write) is removed, so the message appears once.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no pending entry exists for `key` (never
    /// inserted, already resolved, or rolled back).
    pub fn resolve_pending(&mut self, key: LocalKey, confirmed_id: MessageId) -> Result<(), StoreError> {
        let idx = self.pending_index(key).ok_or(StoreError::NotFound(key))?;
        let entry = &mut self.entries[idx];
        entry.status = DeliveryStatus::Confirmed;
        entry.id = Some(confirmed_id.clone());
        self.entries
            .retain(|m| m.local_key == Some(key) || m.id.as_ref() != Some(&confirmed_id));
        Ok(())
    }

    /// Rolls back the pending entry for `key` according to the failure policy.
    ///
    /// Returns whether a pending entry was found.
    pub fn rollback_pending(&mut self, key: LocalKey) -> bool {
        let Some(idx) = self.pending_index(key) else {
            return false;
        };
        match self.policy {
            FailurePolicy::Remove => {
                self.entries.remove(idx);
            }
            FailurePolicy::MarkFailed => self.entries[idx].status = DeliveryStatus::Failed,
        }
        true
    }

    /// Returns a restartable, read-only ordered view of all messages.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            inner: self.entries.iter(),
        }
    }

    /// Looks up the entry carrying `key`.
    #[must_use]
    pub fn get(&self, key: LocalKey) -> Option<&Message> {
        self.entries.iter().find(|m| m.local_key == Some(key))
    }

    /// Number of messages in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the store holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The failure policy applied by [`rollback_pending`](Self::rollback_pending).
    #[must_use]
    pub const fn policy(&self) -> FailurePolicy {
        self.policy
    }

    fn ensure_absent(&self, key: LocalKey) -> Result<(), StoreError> {
        if self.get(key).is_some() {
            return Err(StoreError::DuplicateKey(key));
        }
        Ok(())
    }

    fn pending_index(&self, key: LocalKey) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|m| m.local_key == Some(key) && m.is_pending())
    }

    // New messages are almost always the latest, so scan from the tail.
    fn place(&mut self, msg: Message) {
        let mut idx = self.entries.len();
        while idx > 0 && self.entries[idx - 1].timestamp > msg.timestamp {
            idx -= 1;
        }
        self.entries.insert(idx, msg);
    }
}

/// Ordered read-only iterator over a store's messages.
///
/// Cloning restarts iteration from the current position; call
/// [`MessageStore::snapshot`] again to start from the beginning.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    inner: std::slice::Iter<'a, Message>,
}

impl<'a> Iterator for Snapshot<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Snapshot<'_> {}

/// Monotonic counter identifying one conversation activation.
pub type Epoch = u64;

#[derive(Debug)]
struct Slot {
    epoch: Epoch,
    store: MessageStore,
}

/// The active conversation's store, guarded by its activation epoch.
#[derive(Debug, Clone)]
pub struct SharedStore {
    slot: Arc<Mutex<Slot>>,
    policy: FailurePolicy,
}

impl SharedStore {
    /// Creates an empty shared store at epoch 0.
    #[must_use]
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                epoch: 0,
                store: MessageStore::new(policy),
            })),
            policy,
        }
    }

    /// Starts a new activation: bumps the epoch, installs a fresh empty
    /// store, and returns a handle bound to the new epoch.
    ///
    /// Handles from earlier activations are invalidated.
    #[must_use]
    pub fn begin(&self) -> StoreHandle {
        let mut slot = self.slot.lock();
        slot.epoch += 1;
        slot.store = MessageStore::new(self.policy);
        StoreHandle {
            slot: Arc::clone(&self.slot),
            epoch: slot.epoch,
        }
    }

    /// Ends the current activation, discarding its contents.
    pub fn retire(&self) {
        let mut slot = self.slot.lock();
        slot.epoch += 1;
        slot.store = MessageStore::new(self.policy);
    }

    /// Returns an owned, ordered copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.slot.lock().store.snapshot().cloned().collect()
    }

    /// The current epoch.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.slot.lock().epoch
    }
}

/// Access to the store of one specific activation.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    slot: Arc<Mutex<Slot>>,
    epoch: Epoch,
}

impl StoreHandle {
    /// Runs `f` against the store if this handle's activation is still
    /// current. Returns `None` (without calling `f`) once it is stale.
    ///
    /// The lock is held only for the duration of `f`; never await inside it.
    pub fn with<R>(&self, f: impl FnOnce(&mut MessageStore) -> R) -> Option<R> {
        let mut slot = self.slot.lock();
        if slot.epoch != self.epoch {
            return None;
        }
        Some(f(&mut slot.store))
    }

    /// Returns `true` while this handle's activation is current.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.slot.lock().epoch == self.epoch
    }

    /// The epoch this handle is bound to.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }
}
