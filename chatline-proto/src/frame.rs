//! Push-channel frames exchanged between clients and the relay hub.
//!
//! The channel carries named events. A client announces itself with
//! `add-user`, publishes outgoing messages with `send-msg`, and the hub
//! delivers them to the addressed participant as `msg-receive`.

use serde::{Deserialize, Serialize};

use crate::message::ParticipantId;

/// Event name a client emits to publish a message to a peer.
pub const EVENT_SEND_MSG: &str = "send-msg";

/// Event name under which a client receives messages from peers.
pub const EVENT_MSG_RECEIVE: &str = "msg-receive";

/// Event name a client emits to register its participant id with the hub.
pub const EVENT_ADD_USER: &str = "add-user";

/// Payload of a `send-msg` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMsg {
    /// Addressed participant.
    pub to: ParticipantId,
    /// Authoring participant (the hub overwrites this with the registered id).
    pub from: ParticipantId,
    /// Message text.
    pub body: String,
}

/// Payload of a `msg-receive` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgReceive {
    /// Authoring participant, as attested by the hub.
    pub from: ParticipantId,
    /// Message text.
    pub body: String,
}

/// Top-level frame carried in one binary WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client registers its participant id. Must be the first frame sent.
    AddUser {
        /// The registering participant.
        participant: ParticipantId,
    },
    /// Hub acknowledges registration.
    Registered {
        /// The participant that was registered (echoed back).
        participant: ParticipantId,
    },
    /// Client publishes a message to a peer.
    SendMsg(SendMsg),
    /// Hub delivers a message from a peer.
    MsgReceive(MsgReceive),
    /// Hub reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

impl Frame {
    /// Returns the channel event name this frame corresponds to.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::AddUser { .. } | Self::Registered { .. } => EVENT_ADD_USER,
            Self::SendMsg(_) => EVENT_SEND_MSG,
            Self::MsgReceive(_) => EVENT_MSG_RECEIVE,
            Self::Error { .. } => "error",
        }
    }
}
