//! Conversation session: owns the active conversation and its resources.
//!
//! [`ConversationSession`] ties the store, the history loader, the live
//! inbox, and the outbound pipeline to one active conversation at a time.
//! Activating a conversation tears the previous one down first: its history
//! task is aborted, its channel handler removed, its inbox pump stopped, and
//! its store epoch retired, so nothing started for it can reach the new
//! conversation's store.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatline_proto::message::{ConversationId, MessageId, ParticipantId, Timestamp, ValidationError};

use crate::channel::{ChannelError, PushChannel};
use crate::history::HistoryLoader;
use crate::inbox::LiveInbox;
use crate::message::{LocalKey, Message};
use crate::outbound::{OutboundPipeline, SendError, SendOutcome};
use crate::persistence::{Persistence, WriteError};
use crate::store::{FailurePolicy, SharedStore, StoreError, StoreHandle};

/// Default capacity of the session event queue.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Notifications emitted by a [`ConversationSession`] for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The active conversation's history was applied to the store.
    HistoryLoaded {
        /// Peer of the loaded conversation.
        peer: ParticipantId,
        /// Number of history messages.
        count: usize,
    },
    /// The history fetch failed; the store holds only live entries.
    HistoryFailed {
        /// Peer of the conversation.
        peer: ParticipantId,
        /// Failure description.
        reason: String,
    },
    /// A live message from the peer was appended.
    MessageReceived {
        /// The sending peer.
        from: ParticipantId,
        /// Arrival time.
        timestamp: Timestamp,
    },
    /// A pending send was confirmed by the persistence service.
    SendConfirmed {
        /// Key of the optimistic entry.
        local_key: LocalKey,
        /// Identifier assigned by persistence.
        message_id: MessageId,
    },
    /// A pending send failed and was rolled back.
    SendFailed {
        /// Key of the optimistic entry.
        local_key: LocalKey,
        /// The write error.
        error: WriteError,
    },
    /// A store operation was refused; the operation had no effect.
    StoreAnomaly(StoreError),
}

/// Errors returned when activating a conversation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The conversation identity is invalid.
    #[error("invalid conversation: {0}")]
    Validation(#[from] ValidationError),

    /// The live inbox could not subscribe to the push channel.
    #[error("push channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Explicit per-session settings.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// The local participant.
    pub participant: ParticipantId,
    /// What happens to a pending entry whose write fails.
    pub policy: FailurePolicy,
    /// Capacity of the [`SessionEvent`] queue.
    pub event_buffer: usize,
}

impl SessionContext {
    /// Settings for `participant` with default policy and buffer sizes.
    #[must_use]
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            policy: FailurePolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Use `policy` for failed sends.
    #[must_use]
    pub const fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

struct Activation<C: PushChannel> {
    conversation: ConversationId,
    store: StoreHandle,
    inbox: LiveInbox<C>,
    history: JoinHandle<()>,
}

impl<C: PushChannel> Activation<C> {
    fn close(self) {
        self.history.abort();
        self.inbox.close();
        tracing::debug!(conversation = %self.conversation, "activation torn down");
    }
}

/// Keeps the displayed conversation consistent with persistence and the
/// live channel.
pub struct ConversationSession<P, C: PushChannel> {
    context: SessionContext,
    channel: Arc<C>,
    shared: SharedStore,
    loader: HistoryLoader<P>,
    pipeline: OutboundPipeline<P, C>,
    active: Mutex<Option<Activation<C>>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl<P, C> ConversationSession<P, C>
where
    P: Persistence + 'static,
    C: PushChannel + 'static,
{
    /// Create a session with no active conversation.
    pub fn new(context: SessionContext, persistence: Arc<P>, channel: Arc<C>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(context.event_buffer.max(1));
        Self {
            shared: SharedStore::new(context.policy),
            loader: HistoryLoader::new(Arc::clone(&persistence)),
            pipeline: OutboundPipeline::new(persistence, Arc::clone(&channel), events_tx.clone()),
            channel,
            context,
            active: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Make the conversation with `peer` the active one.
    ///
    /// The previous conversation is torn down first. The new store starts
    /// empty; the live inbox is subscribed and the history fetch started,
    /// both bound to this activation. Re-activating the current peer starts
    /// over with a fresh fetch.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Validation`] for a blank peer, or
    /// [`SessionError::Channel`] if the inbox cannot subscribe. In both cases
    /// no conversation is active afterwards.
    pub fn activate(&self, peer: ParticipantId) -> Result<(), SessionError> {
        let conversation = ConversationId::new(self.context.participant.clone(), peer);
        conversation.validate()?;

        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            previous.close();
        }

        let store = self.shared.begin();
        let inbox = match LiveInbox::subscribe(
            Arc::clone(&self.channel),
            conversation.peer.clone(),
            store.clone(),
            self.events_tx.clone(),
        ) {
            Ok(inbox) => inbox,
            Err(e) => {
                self.shared.retire();
                tracing::warn!(conversation = %conversation, error = %e, "live inbox subscription failed");
                return Err(e.into());
            }
        };
        let history = self
            .loader
            .spawn(conversation.clone(), store.clone(), self.events_tx.clone());

        tracing::info!(conversation = %conversation, epoch = store.epoch(), "conversation activated");
        *active = Some(Activation {
            conversation,
            store,
            inbox,
            history,
        });
        Ok(())
    }

    /// Tear down the active conversation and discard its store.
    pub fn deactivate(&self) {
        // Held across teardown so a concurrent activate cannot begin an
        // epoch that the retire below would invalidate.
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            previous.close();
            self.shared.retire();
            tracing::info!("conversation deactivated");
        }
    }

    /// Send `body` to the active peer.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NoActive`] when no conversation is active, and
    /// otherwise whatever [`OutboundPipeline::send`] returns.
    pub async fn send(&self, body: &str) -> Result<SendOutcome, SendError> {
        let (conversation, store) = {
            let active = self.active.lock();
            let activation = active.as_ref().ok_or(SendError::NoActive)?;
            (activation.conversation.clone(), activation.store.clone())
        };
        self.pipeline.send(body, &conversation, &store).await
    }
}

impl<P, C: PushChannel> ConversationSession<P, C> {
    /// Owned, ordered copy of the active conversation's messages.
    ///
    /// Empty when no conversation is active.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.shared.snapshot()
    }

    /// The active conversation, if any.
    #[must_use]
    pub fn active(&self) -> Option<ConversationId> {
        self.active.lock().as_ref().map(|a| a.conversation.clone())
    }

    /// The local participant.
    #[must_use]
    pub const fn participant(&self) -> &ParticipantId {
        &self.context.participant
    }

    /// Take the [`SessionEvent`] receiver. Returns `None` after the first
    /// call.
    pub fn events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }
}

impl<P, C: PushChannel> Drop for ConversationSession<P, C> {
    fn drop(&mut self) {
        if let Some(activation) = self.active.get_mut().take() {
            activation.close();
        }
    }
}
