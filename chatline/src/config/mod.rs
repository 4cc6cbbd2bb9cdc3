//! Configuration system for the `Chatline` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatline/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chatline_proto::message::ParticipantId;

use crate::channel::relay::ChannelConfig;
use crate::session::{DEFAULT_EVENT_BUFFER, SessionContext};
use crate::store::FailurePolicy;

/// Errors that can occur when loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// No local participant was configured.
    #[error("no participant configured (use --participant or [network] participant)")]
    MissingParticipant,

    /// The relay URL is not a usable WebSocket URL.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl {
        /// The configured URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    session: SessionFileConfig,
    display: DisplayFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    participant: Option<String>,
    peer: Option<String>,
    connect_timeout_secs: Option<u64>,
    register_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    failure_policy: Option<FailurePolicy>,
    event_buffer: Option<usize>,
}

/// `[display]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DisplayFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Relay hub WebSocket URL. `None` runs the offline in-process demo.
    pub relay_url: Option<String>,
    /// Local participant identity.
    pub participant: Option<String>,
    /// Peer to open on startup.
    pub peer: Option<String>,
    /// Timeout for connecting to the relay hub.
    pub connect_timeout: Duration,
    /// Timeout for the hub's registration acknowledgment.
    pub register_timeout: Duration,
    /// Capacity of the CLI input queue.
    pub channel_capacity: usize,

    // -- Session --
    /// What happens to a pending entry whose write fails.
    pub failure_policy: FailurePolicy,
    /// Capacity of the session event queue.
    pub event_buffer: usize,

    // -- Display --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            participant: None,
            peer: None,
            connect_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            failure_policy: FailurePolicy::Remove,
            event_buffer: DEFAULT_EVENT_BUFFER,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/chatline/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone()),
            participant: cli
                .participant
                .clone()
                .or_else(|| file.network.participant.clone()),
            peer: cli.peer.clone().or_else(|| file.network.peer.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            register_timeout: file
                .network
                .register_timeout_secs
                .map_or(defaults.register_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            failure_policy: cli
                .failure_policy
                .or(file.session.failure_policy)
                .unwrap_or(defaults.failure_policy),
            event_buffer: file.session.event_buffer.unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.display.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The configured local participant.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParticipant`] if none is set or it is
    /// blank.
    pub fn participant_id(&self) -> Result<ParticipantId, ConfigError> {
        let participant = self
            .participant
            .as_deref()
            .map(ParticipantId::new)
            .ok_or(ConfigError::MissingParticipant)?;
        if participant.is_blank() {
            return Err(ConfigError::MissingParticipant);
        }
        Ok(participant)
    }

    /// Build the [`SessionContext`] for the configured participant.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingParticipant`] if no participant is set.
    pub fn session_context(&self) -> Result<SessionContext, ConfigError> {
        Ok(SessionContext {
            participant: self.participant_id()?,
            policy: self.failure_policy,
            event_buffer: self.event_buffer,
        })
    }

    /// Build a [`ChannelConfig`] for the relay hub.
    ///
    /// Returns `Ok(None)` when no relay URL is configured (offline demo
    /// mode).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRelayUrl`] if the URL does not parse or
    /// is not `ws://`/`wss://`, and [`ConfigError::MissingParticipant`] if
    /// no participant is set.
    pub fn to_channel_config(&self) -> Result<Option<ChannelConfig>, ConfigError> {
        let Some(relay_url) = self.relay_url.clone() else {
            return Ok(None);
        };
        let parsed = url::Url::parse(&relay_url).map_err(|e| ConfigError::InvalidRelayUrl {
            url: relay_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidRelayUrl {
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
                url: relay_url,
            });
        }

        Ok(Some(ChannelConfig {
            relay_url,
            participant: self.participant_id()?,
            connect_timeout: self.connect_timeout,
            register_timeout: self.register_timeout,
        }))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Line-based chat client with optimistic delivery")]
pub struct CliArgs {
    /// WebSocket URL of the relay hub. Omit for the offline demo.
    #[arg(long, env = "RELAY_URL")]
    pub relay_url: Option<String>,

    /// Your participant identity.
    #[arg(long, env = "CHATLINE_PARTICIPANT")]
    pub participant: Option<String>,

    /// Peer to open on startup.
    #[arg(long, env = "CHATLINE_PEER")]
    pub peer: Option<String>,

    /// Path to config file (default: `~/.config/chatline/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// What to do with a message whose write fails (remove, mark-failed).
    #[arg(long)]
    pub failure_policy: Option<FailurePolicy>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatline.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatline").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
