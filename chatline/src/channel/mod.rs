//! Push channel abstraction for `Chatline`.
//!
//! Defines the [`PushChannel`] trait the session consumes: fire-and-forget
//! `emit` of outgoing messages and `on`/`off` registration of handlers for
//! incoming ones. Concrete implementations:
//! - [`hub::HubChannel`]: in-process hub endpoint for tests and the offline demo
//! - [`relay::RelayChannel`]: WebSocket client of the `chatline-relay` hub

pub mod hub;
pub mod relay;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use chatline_proto::codec::CodecError;
use chatline_proto::frame::{EVENT_MSG_RECEIVE, MsgReceive, SendMsg};
use chatline_proto::message::{ParticipantId, Timestamp};

/// Queue a handler receives `msg-receive` events on.
///
/// Unbounded: the channel never drops an event because a consumer lags.
pub type Handler = mpsc::UnboundedSender<Delivery>;

/// A `msg-receive` event as handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sender, as assigned by the hub.
    pub from: ParticipantId,
    /// Message text.
    pub body: String,
    /// When the channel received the event.
    pub received_at: Timestamp,
}

/// Identifies one registered handler, for later removal with `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Errors that can occur during push channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The underlying connection is gone.
    #[error("push channel closed")]
    Closed,

    /// Handlers can only be registered for events the channel delivers.
    #[error("unsupported event '{0}'")]
    UnsupportedEvent(String),

    /// The operation timed out before completing.
    #[error("push channel operation timed out")]
    Timeout,

    /// The hub rejected the connection.
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O or WebSocket error occurred.
    #[error("push channel I/O error: {0}")]
    Io(String),
}

/// Bidirectional event transport for live messages.
///
/// Registration calls never block. Incoming `msg-receive` events are stamped
/// on arrival and pushed into every handler's queue in channel arrival order.
pub trait PushChannel: Send + Sync {
    /// Announce a message to its recipient (`send-msg`).
    ///
    /// Returns once the frame is handed to the channel; delivery is
    /// best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the channel cannot accept the frame.
    fn emit(&self, msg: SendMsg) -> Result<(), ChannelError>;

    /// Register `handler` for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnsupportedEvent`] for events other than
    /// `msg-receive`.
    fn on(&self, event: &str, handler: Handler) -> Result<HandlerId, ChannelError>;

    /// Remove a handler. Returns whether it was registered.
    fn off(&self, event: &str, id: HandlerId) -> bool;
}

/// Handler table shared by the channel implementations.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Handler)>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::UnsupportedEvent`] unless `event` is
    /// `msg-receive`.
    pub fn register(
        &self,
        event: &str,
        handler: Handler,
    ) -> Result<HandlerId, ChannelError> {
        if event != EVENT_MSG_RECEIVE {
            return Err(ChannelError::UnsupportedEvent(event.to_string()));
        }
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        Ok(id)
    }

    /// Remove a handler, returning whether it was present.
    pub fn remove(&self, event: &str, id: HandlerId) -> bool {
        if event != EVENT_MSG_RECEIVE {
            return false;
        }
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Deliver `msg` to every registered handler, stamped with the current
    /// time.
    ///
    /// Handlers whose receiver is gone are pruned.
    pub fn dispatch(&self, msg: &MsgReceive) {
        let delivery = Delivery {
            from: msg.from.clone(),
            body: msg.body.clone(),
            received_at: Timestamp::now(),
        };
        self.handlers.lock().retain(|(id, tx)| {
            let open = tx.send(delivery.clone()).is_ok();
            if !open {
                tracing::debug!(handler = %id, "handler receiver dropped, pruning");
            }
            open
        });
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns `true` if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}
