//! Live delivery of the peer's messages into the active store.
//!
//! A [`LiveInbox`] owns two resources for one activation: a
//! [`Subscription`] (the `msg-receive` handler registered on the push
//! channel) and the pump task that turns each received event into an inbound
//! message. Closing or dropping the inbox detaches the handler before the
//! pump is stopped, so no event for a stale conversation reaches a new store.

use std::sync::Arc;

use tokio::sync::mpsc;

use chatline_proto::frame::EVENT_MSG_RECEIVE;
use chatline_proto::message::ParticipantId;

use crate::channel::{ChannelError, Delivery, Handler, HandlerId, PushChannel};
use crate::message::Message;
use crate::session::SessionEvent;
use crate::store::StoreHandle;

/// A handler registered on a push channel, removed on drop.
pub struct Subscription<C: PushChannel> {
    channel: Arc<C>,
    event: &'static str,
    id: Option<HandlerId>,
}

impl<C: PushChannel> Subscription<C> {
    /// Register `handler` for `event` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns the channel's [`ChannelError`] if registration is refused.
    pub fn acquire(
        channel: Arc<C>,
        event: &'static str,
        handler: Handler,
    ) -> Result<Self, ChannelError> {
        let id = channel.on(event, handler)?;
        Ok(Self {
            channel,
            event,
            id: Some(id),
        })
    }

    /// Remove the handler now. Returns whether the channel still had it.
    pub fn release(mut self) -> bool {
        self.detach()
    }

    /// The registered handler, while attached.
    #[must_use]
    pub const fn handler_id(&self) -> Option<HandlerId> {
        self.id
    }

    fn detach(&mut self) -> bool {
        self.id
            .take()
            .is_some_and(|id| self.channel.off(self.event, id))
    }
}

impl<C: PushChannel> Drop for Subscription<C> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Live inbound feed for one activation.
pub struct LiveInbox<C: PushChannel> {
    peer: ParticipantId,
    subscription: Option<Subscription<C>>,
    pump: tokio::task::JoinHandle<()>,
}

impl<C: PushChannel + 'static> LiveInbox<C> {
    /// Subscribe to `msg-receive` and start appending `peer`'s messages to
    /// `store`.
    ///
    /// Events from other participants are ignored. Each accepted event
    /// becomes an inbound, confirmed message stamped with the time the
    /// channel received it. The handler queue is unbounded, so a burst is
    /// never truncated while the pump catches up.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] if the handler cannot be registered.
    pub fn subscribe(
        channel: Arc<C>,
        peer: ParticipantId,
        store: StoreHandle,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Subscription::acquire(channel, EVENT_MSG_RECEIVE, tx)?;
        tracing::debug!(peer = %peer, "live inbox subscribed");
        let pump = tokio::spawn(pump(rx, peer.clone(), store, events));
        Ok(Self {
            peer,
            subscription: Some(subscription),
            pump,
        })
    }
}

impl<C: PushChannel> LiveInbox<C> {
    /// The peer this inbox listens for.
    #[must_use]
    pub const fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Detach from the channel and stop the pump.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.release();
            tracing::debug!(peer = %self.peer, "live inbox unsubscribed");
        }
        self.pump.abort();
    }
}

impl<C: PushChannel> Drop for LiveInbox<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    peer: ParticipantId,
    store: StoreHandle,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(event) = rx.recv().await {
        if event.from != peer {
            tracing::debug!(from = %event.from, active = %peer, "ignoring message for another conversation");
            continue;
        }
        let message = Message::inbound(event.body, event.received_at);
        let timestamp = message.timestamp;
        match store.with(|s| s.append_confirmed(message)) {
            None => {
                tracing::debug!(peer = %peer, "conversation changed, inbox pump stopping");
                break;
            }
            Some(Ok(())) => {
                let _ = events.try_send(SessionEvent::MessageReceived {
                    from: peer.clone(),
                    timestamp,
                });
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %peer, error = %e, "inbound message rejected by store");
                let _ = events.try_send(SessionEvent::StoreAnomaly(e));
            }
        }
    }
}
