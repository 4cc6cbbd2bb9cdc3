//! Optimistic send pipeline.
//!
//! A send moves through `Created -> Pending -> {Confirmed, Failed}`:
//! 1. validate the body and the conversation identity
//! 2. claim the single in-flight slot
//! 3. insert a pending entry keyed by a fresh [`LocalKey`]
//! 4. announce the message on the push channel (fire-and-forget)
//! 5. write it to the persistence service
//! 6. resolve the pending entry with the returned id, or roll it back
//!
//! The store is only touched through the activation's [`StoreHandle`], so a
//! write that completes after a conversation switch cannot modify the new
//! conversation's store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use chatline_proto::frame::SendMsg;
use chatline_proto::message::{ConversationId, MessageId, Timestamp, ValidationError, validate_body};

use crate::channel::PushChannel;
use crate::message::{KeyGenerator, LocalKey, Message};
use crate::persistence::{Persistence, WriteError};
use crate::session::SessionEvent;
use crate::store::StoreHandle;

/// Errors returned by [`OutboundPipeline::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The body or the conversation identity is invalid. Nothing was sent.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Another send is still in flight.
    #[error("a send is already in progress")]
    Busy,

    /// The persistence write failed; the optimistic entry was rolled back.
    #[error("send failed: {0}")]
    Failed(WriteError),

    /// No conversation is active.
    #[error("no active conversation")]
    NoActive,
}

/// Result of a confirmed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Key the optimistic entry was inserted under.
    pub local_key: LocalKey,
    /// Identifier assigned by the persistence service.
    pub message_id: MessageId,
}

/// Releases the in-flight slot on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives outgoing messages through the optimistic send state machine.
pub struct OutboundPipeline<P, C> {
    persistence: Arc<P>,
    channel: Arc<C>,
    keys: KeyGenerator,
    in_flight: AtomicBool,
    events: mpsc::Sender<SessionEvent>,
}

impl<P: Persistence, C: PushChannel> OutboundPipeline<P, C> {
    /// Create a pipeline over the given collaborators.
    ///
    /// Outcomes are also reported as [`SessionEvent`]s on `events`.
    pub const fn new(
        persistence: Arc<P>,
        channel: Arc<C>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            persistence,
            channel,
            keys: KeyGenerator::new(),
            in_flight: AtomicBool::new(false),
            events,
        }
    }

    /// Returns `true` while a send is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Send `body` to the peer of `conversation`.
    ///
    /// The pending entry is visible in the store before any I/O starts. The
    /// channel announcement is best-effort and is not retracted if the write
    /// later fails.
    ///
    /// # Errors
    ///
    /// - [`SendError::Validation`] if the body is blank or too large, or the
    ///   conversation has a blank participant
    /// - [`SendError::Busy`] if a previous send has not finished
    /// - [`SendError::NoActive`] if `store` no longer belongs to the active
    ///   conversation
    /// - [`SendError::Failed`] if the persistence write fails
    pub async fn send(
        &self,
        body: &str,
        conversation: &ConversationId,
        store: &StoreHandle,
    ) -> Result<SendOutcome, SendError> {
        validate_body(body)?;
        conversation.validate()?;

        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            tracing::debug!(peer = %conversation.peer, "send rejected, previous send in flight");
            return Err(SendError::Busy);
        };

        let local_key = self.keys.next_key();
        let pending = Message::pending(local_key, body.to_string(), Timestamp::now());
        match store.with(|s| s.insert_pending(pending)) {
            None => return Err(SendError::NoActive),
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::warn!(key = %local_key, error = %e, "pending entry rejected by store");
                let _ = self.events.try_send(SessionEvent::StoreAnomaly(e));
            }
        }
        tracing::debug!(key = %local_key, peer = %conversation.peer, "message pending");

        let announcement = SendMsg {
            to: conversation.peer.clone(),
            from: conversation.participant.clone(),
            body: body.to_string(),
        };
        if let Err(e) = self.channel.emit(announcement) {
            tracing::warn!(key = %local_key, error = %e, "live announcement failed");
        }

        let result = self
            .persistence
            .write_message(&conversation.participant, &conversation.peer, body)
            .await;

        match result {
            Ok(receipt) => {
                self.confirm(store, local_key, receipt.id.clone());
                Ok(SendOutcome {
                    local_key,
                    message_id: receipt.id,
                })
            }
            Err(e) => {
                self.fail(store, local_key, &e);
                Err(SendError::Failed(e))
            }
        }
    }

    fn confirm(&self, store: &StoreHandle, local_key: LocalKey, message_id: MessageId) {
        match store.with(|s| s.resolve_pending(local_key, message_id.clone())) {
            None => {
                tracing::debug!(key = %local_key, "conversation changed, discarding confirmation");
            }
            Some(Ok(())) => {
                tracing::info!(key = %local_key, message_id = %message_id, "message confirmed");
                let _ = self.events.try_send(SessionEvent::SendConfirmed {
                    local_key,
                    message_id,
                });
            }
            Some(Err(e)) => {
                tracing::warn!(key = %local_key, error = %e, "confirmation could not be applied");
                let _ = self.events.try_send(SessionEvent::StoreAnomaly(e));
            }
        }
    }

    fn fail(&self, store: &StoreHandle, local_key: LocalKey, error: &WriteError) {
        tracing::warn!(key = %local_key, error = %error, "message write failed");
        match store.with(|s| s.rollback_pending(local_key)) {
            None => {
                tracing::debug!(key = %local_key, "conversation changed, discarding rollback");
            }
            Some(found) => {
                if !found {
                    tracing::debug!(key = %local_key, "no pending entry to roll back");
                }
                let _ = self.events.try_send(SessionEvent::SendFailed {
                    local_key,
                    error: error.clone(),
                });
            }
        }
    }
}
