//! Identity, time, and status types shared by every `Chatline` component.
//!
//! These types are plain data: they carry no behavior beyond construction,
//! display, and validation, and they serialize with serde so the same
//! definitions are used on the push channel and by persistence records.

use serde::{Deserialize, Serialize};

/// Maximum allowed message body size in bytes (64 KB).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Opaque identifier of a chat participant (the local user or a peer).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a participant identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the identifier is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a one-to-one conversation: the local participant and the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    /// The local participant (author of outbound messages).
    pub participant: ParticipantId,
    /// The remote peer.
    pub peer: ParticipantId,
}

impl ConversationId {
    /// Creates a conversation identity for `participant` talking to `peer`.
    #[must_use]
    pub const fn new(participant: ParticipantId, peer: ParticipantId) -> Self {
        Self { participant, peer }
    }

    /// Checks that both sides of the conversation are non-blank.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidParticipant`] naming the first blank
    /// identifier.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.participant.is_blank() {
            return Err(ValidationError::InvalidParticipant("participant".into()));
        }
        if self.peer.is_blank() {
            return Err(ValidationError::InvalidParticipant("peer".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.participant, self.peer)
    }
}

/// Identifier assigned by the persistence service to a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Who authored a message, relative to the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Authored by the local participant.
    Outbound,
    /// Authored by the remote peer.
    Inbound,
}

/// Delivery lifecycle of a message as seen by the local client.
///
/// Only outbound messages move through `Pending`; inbound messages are
/// always `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Shown optimistically, awaiting persistence acknowledgment.
    Pending,
    /// Acknowledged by the persistence service (or received from the peer).
    Confirmed,
    /// Persistence rejected the message.
    Failed,
}

/// Error returned when a message or conversation fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message body is empty after trimming whitespace.
    #[error("message body is empty")]
    EmptyBody,
    /// Message body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// A conversation identifier is blank.
    #[error("invalid conversation: {0} id is blank")]
    InvalidParticipant(String),
}

/// Validates a message body for sending.
///
/// The body must be non-empty after trimming and at most
/// [`MAX_BODY_SIZE`] bytes.
///
/// # Errors
///
/// Returns [`ValidationError::EmptyBody`] for a blank body, or
/// [`ValidationError::TooLarge`] if it exceeds `MAX_BODY_SIZE`.
pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    let size = body.len();
    if size > MAX_BODY_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_BODY_SIZE,
        });
    }
    Ok(())
}
