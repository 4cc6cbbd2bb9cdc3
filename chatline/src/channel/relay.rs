//! WebSocket push channel backed by the `chatline-relay` hub.
//!
//! [`RelayChannel::connect`] opens a WebSocket, registers the local
//! participant with an `add-user` frame and waits for the hub's
//! acknowledgment. After that a writer task drains emitted frames into the
//! socket and a reader task dispatches `msg-receive` frames to the
//! registered handlers in arrival order.
//!
//! Reconnection is out of scope: once the socket closes, `emit` fails with
//! [`ChannelError::Closed`] and handlers stop receiving events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chatline_proto::codec;
use chatline_proto::frame::{Frame, SendMsg};
use chatline_proto::message::ParticipantId;

use super::{ChannelError, Handler, HandlerId, HandlerRegistry, PushChannel};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for connecting to the relay hub.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the hub's `Registered` acknowledgment.
const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for a [`RelayChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL of the hub (e.g., `ws://127.0.0.1:9000/ws`).
    pub relay_url: String,
    /// Participant to register as.
    pub participant: ParticipantId,
    /// Timeout for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Timeout for the registration acknowledgment.
    pub register_timeout: Duration,
}

impl ChannelConfig {
    /// Creates a `ChannelConfig` with default timeouts.
    #[must_use]
    pub const fn new(relay_url: String, participant: ParticipantId) -> Self {
        Self {
            relay_url,
            participant,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
        }
    }
}

/// Push channel over a WebSocket connection to the relay hub.
pub struct RelayChannel {
    /// Participant this connection is registered as.
    local_id: ParticipantId,
    /// The hub URL (ws:// or wss://).
    relay_url: String,
    /// Outgoing frames, drained by the writer task.
    outgoing: mpsc::UnboundedSender<Message>,
    /// Handlers for `msg-receive`.
    handlers: Arc<HandlerRegistry>,
    /// Whether the WebSocket connection is still up.
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl RelayChannel {
    /// Connect to the hub and register the configured participant.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Timeout`] if connection or registration times out.
    /// - [`ChannelError::Rejected`] if the hub answers with an error frame.
    /// - [`ChannelError::Closed`] if the hub closes during registration.
    /// - [`ChannelError::Io`] for connection and WebSocket failures.
    pub async fn connect(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let relay_url = config.relay_url.as_str();
        let (ws_stream, _response) =
            tokio::time::timeout(config.connect_timeout, connect_async(relay_url))
                .await
                .map_err(|_| {
                    tracing::warn!(url = relay_url, "relay WebSocket connect timed out");
                    ChannelError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = relay_url, err = %e, "relay WebSocket connect failed");
                    map_ws_connect_error(e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let add_user = codec::encode(&Frame::AddUser {
            participant: config.participant.clone(),
        })?;
        ws_sender
            .send(Message::Binary(add_user.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send add-user frame");
                ChannelError::Io(format!("failed to send add-user: {e}"))
            })?;

        await_registration(&mut ws_reader, config.register_timeout, relay_url).await?;

        let connected = Arc::new(AtomicBool::new(true));
        let handlers = Arc::new(HandlerRegistry::new());
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(writer_loop(ws_sender, outgoing_rx, Arc::clone(&connected)));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&handlers),
            Arc::clone(&connected),
        ));

        Ok(Self {
            local_id: config.participant.clone(),
            relay_url: config.relay_url.clone(),
            outgoing,
            handlers,
            connected,
            reader_handle,
            writer_handle,
        })
    }

    /// Return the hub URL this channel is connected to.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Return the registered participant.
    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Whether the WebSocket connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl PushChannel for RelayChannel {
    fn emit(&self, msg: SendMsg) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }
        let bytes = codec::encode(&Frame::SendMsg(msg))?;
        self.outgoing
            .send(Message::Binary(bytes.into()))
            .map_err(|_| ChannelError::Closed)
    }

    fn on(&self, event: &str, handler: Handler) -> Result<HandlerId, ChannelError> {
        self.handlers.register(event, handler)
    }

    fn off(&self, event: &str, id: HandlerId) -> bool {
        self.handlers.remove(event, id)
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

/// Wait for the hub's `Registered` frame.
async fn await_registration(
    ws_reader: &mut WsReader,
    register_timeout: Duration,
    relay_url: &str,
) -> Result<(), ChannelError> {
    let ack = tokio::time::timeout(register_timeout, ws_reader.next())
        .await
        .map_err(|_| {
            tracing::warn!(url = relay_url, "relay registration acknowledgment timed out");
            ChannelError::Timeout
        })?;

    match ack {
        Some(Ok(Message::Binary(data))) => match codec::decode(&data) {
            Ok(Frame::Registered { participant }) => {
                tracing::info!(participant = %participant, url = relay_url, "registered with relay hub");
                Ok(())
            }
            Ok(Frame::Error { reason }) => {
                tracing::warn!(reason = %reason, "relay registration rejected");
                Err(ChannelError::Rejected(reason))
            }
            Ok(other) => {
                tracing::warn!(?other, "unexpected relay frame during registration");
                Err(ChannelError::Io("unexpected frame during registration".into()))
            }
            Err(e) => {
                tracing::warn!(err = %e, "malformed relay registration response");
                Err(ChannelError::Codec(e))
            }
        },
        Some(Ok(Message::Close(_))) | None => {
            tracing::warn!("relay hub closed connection during registration");
            Err(ChannelError::Closed)
        }
        Some(Ok(_)) => Err(ChannelError::Io(
            "unexpected non-binary frame during registration".into(),
        )),
        Some(Err(e)) => Err(ChannelError::Io(format!(
            "WebSocket error during registration: {e}"
        ))),
    }
}

/// Background task forwarding queued frames to the socket.
async fn writer_loop(
    mut ws_sender: WsSender,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = outgoing.recv().await {
        if let Err(e) = ws_sender.send(msg).await {
            tracing::warn!(err = %e, "relay send failed");
            break;
        }
    }
    connected.store(false, Ordering::Relaxed);
}

/// Background task reading frames and dispatching `msg-receive` events.
///
/// Malformed frames are logged and skipped; the task only exits when the
/// socket closes or errors.
async fn reader_loop(mut ws_reader: WsReader, handlers: Arc<HandlerRegistry>, connected: Arc<AtomicBool>) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match codec::decode(&data) {
                Ok(Frame::MsgReceive(msg)) => handlers.dispatch(&msg),
                Ok(Frame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "relay hub error");
                }
                Ok(other) => {
                    tracing::debug!(event = other.event_name(), "ignoring unexpected relay frame");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed relay frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by hub");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "relay WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("relay reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ChannelError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ChannelError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => ChannelError::Io(format!("relay unreachable: {io_err}")),
        WsError::Http(response) => {
            ChannelError::Io(format!("relay HTTP error: status {}", response.status()))
        }
        other => ChannelError::Io(format!("relay connection error: {other}")),
    }
}
