//! In-process push hub.
//!
//! A [`LocalHub`] plays the role of the relay server inside one process:
//! each participant connects and gets a [`HubChannel`] endpoint; a
//! `send-msg` emitted on one endpoint is delivered to the addressed
//! participant's handlers as `msg-receive`. Messages for participants that
//! are not connected are dropped, as the live channel does not queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use chatline_proto::frame::{MsgReceive, SendMsg};
use chatline_proto::message::ParticipantId;

use super::{ChannelError, Handler, HandlerId, HandlerRegistry, PushChannel};

/// Routing table of connected participants.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    online: Arc<Mutex<HashMap<ParticipantId, Arc<HandlerRegistry>>>>,
}

impl LocalHub {
    /// Create a hub with no participants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `participant`, replacing any previous connection for it.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use chatline::channel::hub::LocalHub;
    /// use chatline::channel::PushChannel;
    /// use chatline_proto::frame::{SendMsg, EVENT_MSG_RECEIVE};
    /// use chatline_proto::message::ParticipantId;
    ///
    /// # async fn example() {
    /// let hub = LocalHub::new();
    /// let alice = hub.connect(ParticipantId::new("alice"));
    /// let bob = hub.connect(ParticipantId::new("bob"));
    /// let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    /// bob.on(EVENT_MSG_RECEIVE, tx).unwrap();
    /// alice.emit(SendMsg {
    ///     to: ParticipantId::new("bob"),
    ///     from: ParticipantId::new("alice"),
    ///     body: "hello".into(),
    /// }).unwrap();
    /// assert_eq!(rx.recv().await.unwrap().body, "hello");
    /// # }
    /// ```
    #[must_use]
    pub fn connect(&self, participant: ParticipantId) -> HubChannel {
        let handlers = Arc::new(HandlerRegistry::new());
        if self
            .online
            .lock()
            .insert(participant.clone(), Arc::clone(&handlers))
            .is_some()
        {
            tracing::info!(participant = %participant, "replaced existing hub connection");
        }
        HubChannel {
            local: participant,
            hub: self.clone(),
            handlers,
        }
    }

    /// Returns `true` if `participant` is connected.
    #[must_use]
    pub fn is_online(&self, participant: &ParticipantId) -> bool {
        self.online.lock().contains_key(participant)
    }

    fn route(&self, from: &ParticipantId, msg: SendMsg) {
        let target = self.online.lock().get(&msg.to).cloned();
        let Some(target) = target else {
            tracing::debug!(from = %from, to = %msg.to, "recipient offline, dropping live message");
            return;
        };
        target.dispatch(&MsgReceive {
            from: from.clone(),
            body: msg.body,
        });
    }

    fn disconnect(&self, participant: &ParticipantId, handlers: &Arc<HandlerRegistry>) {
        let mut online = self.online.lock();
        // Only remove our own registration, not a newer replacement.
        if online
            .get(participant)
            .is_some_and(|current| Arc::ptr_eq(current, handlers))
        {
            online.remove(participant);
        }
    }
}

/// One participant's connection to a [`LocalHub`].
#[derive(Debug)]
pub struct HubChannel {
    local: ParticipantId,
    hub: LocalHub,
    handlers: Arc<HandlerRegistry>,
}

impl HubChannel {
    /// The participant this endpoint is registered as.
    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    /// Number of handlers currently registered on this endpoint.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl PushChannel for HubChannel {
    fn emit(&self, msg: SendMsg) -> Result<(), ChannelError> {
        if msg.from != self.local {
            tracing::warn!(claimed = %msg.from, registered = %self.local, "overriding spoofed sender");
        }
        self.hub.route(&self.local, msg);
        Ok(())
    }

    fn on(&self, event: &str, handler: Handler) -> Result<HandlerId, ChannelError> {
        self.handlers.register(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        self.handlers.remove(event, id)
    }
}

impl Drop for HubChannel {
    fn drop(&mut self) {
        self.hub.disconnect(&self.local, &self.handlers);
    }
}
