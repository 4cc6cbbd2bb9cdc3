//! Hub core: online-participant registry, WebSocket handler, and live
//! message routing.
//!
//! The hub accepts WebSocket connections, registers each by the participant
//! named in its `add-user` frame, and routes `send-msg` frames to the
//! addressed participant as `msg-receive`. Messages for participants that are
//! not connected are dropped; the hub keeps no backlog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};

use chatline_proto::codec;
use chatline_proto::frame::{Frame, MsgReceive, SendMsg};
use chatline_proto::message::ParticipantId;

type Outbox = mpsc::Sender<Message>;

/// Limits the hub applies to every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSettings {
    /// Frames larger than this are answered with an error.
    pub max_payload_size: usize,
    /// Capacity of each participant's writer queue. Deliveries that find the
    /// queue full are dropped, since the hub keeps no backlog.
    pub outbound_queue: usize,
    /// Connections that have not sent `add-user` within this window are
    /// rejected and closed.
    pub register_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_payload_size: 64 * 1024,
            outbound_queue: 256,
            register_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared hub state holding the online-participant registry.
pub struct HubState {
    /// Maps each online participant to its WebSocket writer channel.
    connections: RwLock<HashMap<ParticipantId, Outbox>>,
    settings: HubSettings,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    /// Creates an empty hub with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(HubSettings::default())
    }

    /// Creates an empty hub with the given limits.
    #[must_use]
    pub fn with_settings(settings: HubSettings) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Opens a writer queue sized by [`HubSettings::outbound_queue`].
    fn open_outbox(&self) -> (Outbox, mpsc::Receiver<Message>) {
        mpsc::channel(self.settings.outbound_queue.max(1))
    }

    /// Marks `participant` online, returning the connection it replaces.
    ///
    /// The caller is responsible for closing the replaced connection.
    pub async fn add_user(&self, participant: &ParticipantId, sender: Outbox) -> Option<Outbox> {
        self.connections
            .write()
            .await
            .insert(participant.clone(), sender)
    }

    /// Marks `participant` offline if `sender` is still its current
    /// connection. Returns whether an entry was removed.
    pub async fn remove_user(&self, participant: &ParticipantId, sender: &Outbox) -> bool {
        let mut conns = self.connections.write().await;
        // A replaced connection must not evict its successor.
        if conns
            .get(participant)
            .is_some_and(|current| current.same_channel(sender))
        {
            conns.remove(participant);
            return true;
        }
        false
    }

    /// Returns the writer channel of an online participant.
    pub async fn sender(&self, participant: &ParticipantId) -> Option<Outbox> {
        self.connections.read().await.get(participant).cloned()
    }

    /// Number of online participants.
    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a WebSocket Close frame to every online participant.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (participant, sender) in conns.iter() {
            tracing::info!(participant = %participant, "sending close frame");
            let _ = sender.try_send(Message::Close(None));
        }
    }
}

/// Outcome of the registration handshake.
enum Registration {
    Accepted(ParticipantId),
    Rejected(String),
    Closed,
}

/// Handles an upgraded WebSocket connection for a single participant.
///
/// The connection lifecycle:
/// 1. Wait up to [`HubSettings::register_timeout`] for an `AddUser` frame.
/// 2. Mark the participant online and answer `Registered`.
/// 3. Route `SendMsg` frames until either side closes.
/// 4. Mark the participant offline.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let registration = tokio::time::timeout(
        state.settings.register_timeout,
        wait_for_add_user(&mut ws_receiver),
    )
    .await
    .unwrap_or_else(|_| Registration::Rejected("registration timed out".into()));

    let participant = match registration {
        Registration::Accepted(participant) => participant,
        Registration::Rejected(reason) => {
            tracing::warn!(reason = %reason, "registration rejected");
            let _ = send_frame(&mut ws_sender, &Frame::Error { reason }).await;
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
        Registration::Closed => {
            tracing::warn!("connection closed before registration");
            return;
        }
    };

    let (tx, mut rx) = state.open_outbox();
    if let Some(old) = state.add_user(&participant, tx.clone()).await {
        tracing::info!(participant = %participant, "replaced existing connection");
        if old.try_send(Message::Close(None)).is_err() {
            tracing::warn!(participant = %participant, "replaced connection did not take its close frame");
        }
    }

    let ack = Frame::Registered {
        participant: participant.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &ack).await {
        tracing::error!(participant = %participant, error = %e, "failed to send Registered ack");
        state.remove_user(&participant, &tx).await;
        return;
    }
    tracing::info!(participant = %participant, "participant online");

    let writer_participant = participant.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(participant = %writer_participant, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_participant = participant.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_frame(&reader_participant, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(participant = %reader_participant, "received close frame");
                    break;
                }
                _ => {
                    // Ignore text, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.remove_user(&participant, &tx).await;
    tracing::info!(participant = %participant, "participant offline");
}

/// Waits for the first binary frame, which must be `AddUser` with a
/// non-blank participant.
async fn wait_for_add_user(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Registration {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => {
                return match codec::decode(&data) {
                    Ok(Frame::AddUser { participant }) if participant.is_blank() => {
                        Registration::Rejected("participant id is blank".into())
                    }
                    Ok(Frame::AddUser { participant }) => Registration::Accepted(participant),
                    Ok(other) => Registration::Rejected(format!(
                        "expected add-user, got {}",
                        other.event_name()
                    )),
                    Err(e) => Registration::Rejected(format!("malformed registration: {e}")),
                };
            }
            Message::Close(_) => return Registration::Closed,
            _ => {
                // Skip non-binary frames (ping/pong) during registration.
            }
        }
    }
    Registration::Closed
}

/// Handles a binary frame from a registered participant.
async fn handle_binary_frame(participant: &ParticipantId, data: &[u8], state: &Arc<HubState>) {
    let max = state.settings.max_payload_size;
    if data.len() > max {
        tracing::warn!(
            participant = %participant,
            size = data.len(),
            max,
            "frame exceeds size limit"
        );
        let err = Frame::Error {
            reason: format!("payload too large: {} bytes (max {max})", data.len()),
        };
        send_to(state, participant, &err).await;
        return;
    }

    let frame = match codec::decode(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(participant = %participant, error = %e, "failed to decode frame");
            return;
        }
    };

    match frame {
        Frame::SendMsg(msg) => route_message(state, participant, msg).await,
        Frame::AddUser {
            participant: new_id,
        } => {
            tracing::warn!(
                participant = %participant,
                new_id = %new_id,
                "ignoring add-user from already-registered connection"
            );
        }
        other => {
            tracing::warn!(
                participant = %participant,
                event = other.event_name(),
                "unexpected frame from client"
            );
        }
    }
}

/// Delivers `msg` to its addressed participant as `msg-receive`.
///
/// The sender is always the registered participant, never the `from` the
/// client claimed.
async fn route_message(state: &Arc<HubState>, from: &ParticipantId, msg: SendMsg) {
    if msg.from != *from {
        tracing::debug!(claimed = %msg.from, registered = %from, "overriding claimed sender");
    }
    let Some(sender) = state.sender(&msg.to).await else {
        tracing::debug!(from = %from, to = %msg.to, "recipient offline, dropping message");
        return;
    };

    let delivery = Frame::MsgReceive(MsgReceive {
        from: from.clone(),
        body: msg.body,
    });
    match codec::encode(&delivery) {
        Ok(bytes) => match sender.try_send(Message::Binary(bytes.into())) {
            Ok(()) => tracing::debug!(from = %from, to = %msg.to, "message routed"),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(to = %msg.to, "recipient queue full, message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(to = %msg.to, "recipient connection closing, message dropped");
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "failed to encode msg-receive frame");
        }
    }
}

/// Sends a frame to an online participant via its writer channel.
async fn send_to(state: &Arc<HubState>, participant: &ParticipantId, frame: &Frame) {
    if let Some(sender) = state.sender(participant).await
        && let Ok(bytes) = codec::encode(frame)
    {
        let _ = sender.try_send(Message::Binary(bytes.into()));
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &Frame,
) -> Result<(), String> {
    let bytes = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the hub on the given address and returns the bound address and a
/// join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(HubState::new())).await
}

/// Starts the hub with a pre-configured [`HubState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<HubState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay hub error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<HubState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
