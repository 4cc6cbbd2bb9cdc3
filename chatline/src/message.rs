//! Client-side message records.
//!
//! A [`Message`] is what the store holds and what rendering reads: either a
//! confirmed record (history, live inbound, or acknowledged outbound) or an
//! optimistic outbound entry correlated by its [`LocalKey`].

use std::sync::atomic::{AtomicU64, Ordering};

use chatline_proto::message::{DeliveryStatus, Direction, MessageId, ParticipantId, Timestamp};
use chatline_proto::record::HistoryRecord;

/// Client-assigned key correlating an optimistic entry with its outcome.
///
/// Unique within a session's lifetime; never sent to the persistence service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalKey(u64);

impl LocalKey {
    /// Creates a key from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Monotonic source of [`LocalKey`]s.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    next: AtomicU64,
}

impl KeyGenerator {
    /// Creates a generator starting at key 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns a key never handed out before by this generator.
    pub fn next_key(&self) -> LocalKey {
        LocalKey(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// One chat message, confirmed or pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Persistence identifier; `None` until confirmed.
    pub id: Option<MessageId>,
    /// Correlation key for locally originated messages.
    pub local_key: Option<LocalKey>,
    /// Message text.
    pub body: String,
    /// Authored locally or by the peer.
    pub direction: Direction,
    /// Creation (outbound, history) or arrival (live inbound) time.
    pub timestamp: Timestamp,
    /// Delivery status.
    pub status: DeliveryStatus,
}

impl Message {
    /// Builds an optimistic outbound entry awaiting confirmation.
    #[must_use]
    pub const fn pending(local_key: LocalKey, body: String, timestamp: Timestamp) -> Self {
        Self {
            id: None,
            local_key: Some(local_key),
            body,
            direction: Direction::Outbound,
            timestamp,
            status: DeliveryStatus::Pending,
        }
    }

    /// Builds a message received live from the peer.
    #[must_use]
    pub const fn inbound(body: String, arrived_at: Timestamp) -> Self {
        Self {
            id: None,
            local_key: None,
            body,
            direction: Direction::Inbound,
            timestamp: arrived_at,
            status: DeliveryStatus::Confirmed,
        }
    }

    /// Maps a persistence record into a confirmed message.
    ///
    /// The direction is outbound when `record.author` is the local
    /// participant. Records without a creation time are stamped with
    /// `fetched_at`.
    #[must_use]
    pub fn from_record(record: HistoryRecord, local: &ParticipantId, fetched_at: Timestamp) -> Self {
        let direction = if record.author == *local {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        Self {
            id: Some(record.id),
            local_key: None,
            body: record.body,
            direction,
            timestamp: record.created_at.unwrap_or(fetched_at),
            status: DeliveryStatus::Confirmed,
        }
    }

    /// Returns `true` while the message awaits persistence acknowledgment.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}
