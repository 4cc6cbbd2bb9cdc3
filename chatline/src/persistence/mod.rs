//! Persistence collaborator: message history reads and message writes.
//!
//! Defines the [`Persistence`] trait the session consumes. Implementations:
//! - [`memory::InMemoryPersistence`]: in-process record log for tests and
//!   the offline demo

pub mod memory;

use chatline_proto::message::ParticipantId;
use chatline_proto::record::{HistoryRecord, WriteReceipt};

/// Errors returned by a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request could not be completed.
    #[error("history request failed: {0}")]
    Transport(String),
}

/// Errors returned by a message write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// The request could not be completed.
    #[error("write request failed: {0}")]
    Transport(String),
}

/// Async access to the message history service.
///
/// No timeout is imposed by callers; bounding request time is the
/// implementation's responsibility.
pub trait Persistence: Send + Sync {
    /// Fetch the full history between `participant` and `peer`, oldest first.
    fn fetch_history(
        &self,
        participant: &ParticipantId,
        peer: &ParticipantId,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryRecord>, FetchError>> + Send;

    /// Store a message written by `participant` to `peer`.
    fn write_message(
        &self,
        participant: &ParticipantId,
        peer: &ParticipantId,
        body: &str,
    ) -> impl std::future::Future<Output = Result<WriteReceipt, WriteError>> + Send;
}
