//! `Chatline`: line-based chat client.
//!
//! Reads commands and messages from stdin and prints the active
//! conversation to stdout. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/chatline/config.toml`).
//!
//! ```bash
//! # Offline demo (in-process hub and persistence)
//! cargo run --bin chatline -- --participant alice --peer bob
//!
//! # Connect to a relay hub
//! cargo run --bin chatline -- --relay-url ws://127.0.0.1:9000/ws \
//!     --participant alice --peer bob
//! ```
//!
//! Commands: `/switch <peer>`, `/history`, `/leave`, `/quit`. Any other line
//! is sent to the active peer.

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatline::channel::PushChannel;
use chatline::channel::hub::LocalHub;
use chatline::channel::relay::RelayChannel;
use chatline::config::{CliArgs, ClientConfig};
use chatline::outbound::SendError;
use chatline::persistence::memory::InMemoryPersistence;
use chatline::render;
use chatline::session::{ConversationSession, SessionEvent};
use chatline_proto::message::{Direction, ParticipantId};

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout belongs to the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("chatline starting");

    let context = config.session_context().map_err(io::Error::other)?;
    let channel_config = config.to_channel_config().map_err(io::Error::other)?;
    let persistence = Arc::new(InMemoryPersistence::new());

    let result = if let Some(channel_config) = channel_config {
        let channel = RelayChannel::connect(&channel_config)
            .await
            .map_err(io::Error::other)?;
        println!("Connected to {}", channel.relay_url());
        let session = ConversationSession::new(context, persistence, Arc::new(channel));
        run(Arc::new(session), &config).await
    } else {
        // The hub must outlive the session's endpoint.
        let hub = LocalHub::new();
        let channel = hub.connect(context.participant.clone());
        println!("Offline demo: no relay configured");
        let session = ConversationSession::new(context, persistence, Arc::new(channel));
        run(Arc::new(session), &config).await
    };

    tracing::info!("chatline exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatline.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// A parsed input line.
enum Command<'a> {
    Switch(&'a str),
    History,
    Leave,
    Quit,
    Send(&'a str),
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line);
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    match name {
        "switch" => Command::Switch(arg.trim()),
        "history" => Command::History,
        "leave" => Command::Leave,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name),
    }
}

/// Main loop: stdin lines and session events.
async fn run<C>(
    session: Arc<ConversationSession<InMemoryPersistence, C>>,
    config: &ClientConfig,
) -> io::Result<()>
where
    C: PushChannel + 'static,
{
    let Some(mut events) = session.events() else {
        return Err(io::Error::other("session events already taken"));
    };

    if let Some(peer) = config.peer.as_deref() {
        switch(&session, peer);
    }

    let (line_tx, mut line_rx) = mpsc::channel(config.channel_capacity.max(1));
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match parse_command(&line) {
                    Command::Switch(peer) => switch(&session, peer),
                    Command::History => print_history(&session, config),
                    Command::Leave => {
                        session.deactivate();
                        println!("Left conversation");
                    }
                    Command::Quit => break,
                    Command::Send(body) => spawn_send(&session, body.to_string()),
                    Command::Unknown(name) => println!("Unknown command /{name}"),
                }
            }
            Some(event) = events.recv() => {
                print_event(&session, &event, config);
            }
        }
    }

    session.deactivate();
    Ok(())
}

fn switch<C: PushChannel + 'static>(
    session: &ConversationSession<InMemoryPersistence, C>,
    peer: &str,
) {
    match session.activate(ParticipantId::new(peer)) {
        Ok(()) => println!("Now chatting with {peer}"),
        Err(e) => {
            tracing::warn!(peer, error = %e, "activation failed");
            println!("Cannot open conversation: {e}");
        }
    }
}

fn spawn_send<C: PushChannel + 'static>(
    session: &Arc<ConversationSession<InMemoryPersistence, C>>,
    body: String,
) {
    let session = Arc::clone(session);
    tokio::spawn(async move {
        match session.send(&body).await {
            Ok(_) | Err(SendError::Failed(_)) => {}
            Err(SendError::Busy) => println!("Still sending the previous message"),
            Err(SendError::NoActive) => println!("No conversation open (use /switch <peer>)"),
            Err(e @ SendError::Validation(_)) => println!("Not sent: {e}"),
        }
    });
}

fn print_history<C: PushChannel>(
    session: &ConversationSession<InMemoryPersistence, C>,
    config: &ClientConfig,
) {
    let Some(conversation) = session.active() else {
        println!("No conversation open");
        return;
    };
    for message in session.snapshot() {
        println!(
            "{}",
            render::format_message(
                &message,
                &conversation.participant,
                &conversation.peer,
                &config.timestamp_format,
            )
        );
    }
}

fn print_event<C: PushChannel>(
    session: &ConversationSession<InMemoryPersistence, C>,
    event: &SessionEvent,
    config: &ClientConfig,
) {
    match event {
        SessionEvent::HistoryLoaded { peer, count } => {
            println!("-- {count} earlier message(s) with {peer} --");
            print_history(session, config);
        }
        SessionEvent::HistoryFailed { peer, reason } => {
            println!("-- history with {peer} unavailable: {reason} --");
        }
        SessionEvent::MessageReceived { timestamp, .. } => {
            let Some(conversation) = session.active() else { return };
            let latest = session
                .snapshot()
                .into_iter()
                .rev()
                .find(|m| m.direction == Direction::Inbound && m.timestamp == *timestamp);
            if let Some(message) = latest {
                println!(
                    "{}",
                    render::format_message(
                        &message,
                        &conversation.participant,
                        &conversation.peer,
                        &config.timestamp_format,
                    )
                );
            }
        }
        SessionEvent::SendConfirmed { local_key, .. } => {
            tracing::debug!(key = %local_key, "send confirmed");
        }
        SessionEvent::SendFailed { error, .. } => {
            println!("-- message not delivered: {error} --");
        }
        SessionEvent::StoreAnomaly(e) => {
            tracing::warn!(error = %e, "store anomaly");
        }
    }
}
