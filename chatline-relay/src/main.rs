//! `chatline-relay`: push-channel hub for `Chatline` clients.
//!
//! ```bash
//! cargo run --bin chatline-relay -- --listen 127.0.0.1:8080 --outbound-queue 64
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use chatline_relay::config::{RelayCliArgs, RelayConfig};
use chatline_relay::hub::{self, HubState};
use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RelayConfig::load(&RelayCliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatline-relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        listen = %config.listen,
        outbound_queue = config.hub.outbound_queue,
        register_timeout = ?config.hub.register_timeout,
        "starting chatline relay hub"
    );
    let state = Arc::new(HubState::with_settings(config.hub));

    let handle = match hub::start_server_with_state(&config.listen, state).await {
        Ok((addr, handle)) => {
            tracing::info!(%addr, "relay hub listening");
            handle
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay hub");
            return ExitCode::FAILURE;
        }
    };

    match handle.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "relay hub task failed");
            ExitCode::FAILURE
        }
    }
}
