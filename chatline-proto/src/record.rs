//! Persistence-service record types.
//!
//! These are the shapes the message history API returns and accepts; the
//! client maps them into its own message representation.

use serde::{Deserialize, Serialize};

use crate::message::{MessageId, ParticipantId, Timestamp};

/// One stored message as returned by a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Identifier assigned by the persistence service.
    pub id: MessageId,
    /// Participant who wrote the message.
    pub author: ParticipantId,
    /// Message text.
    pub body: String,
    /// Creation time recorded by the service, if any.
    pub created_at: Option<Timestamp>,
}

/// Acknowledgment of a successful message write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Identifier assigned to the newly stored message.
    pub id: MessageId,
}
