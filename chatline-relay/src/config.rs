//! Hub configuration.
//!
//! Values come from, in order of precedence: command-line flags (some also
//! readable from the environment), `~/.config/chatline-relay/config.toml`,
//! and the defaults in [`HubSettings`].
//!
//! ```toml
//! listen = "0.0.0.0:9000"
//!
//! [limits]
//! max_frame_bytes = 65536
//! outbound_queue = 256
//! register_timeout_secs = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::HubSettings;

const DEFAULT_LISTEN: &str = "0.0.0.0:9000";

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A limit was set to a value the hub cannot run with.
    #[error("invalid {field}: must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    limits: FileLimits,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileLimits {
    max_frame_bytes: Option<usize>,
    outbound_queue: Option<usize>,
    register_timeout_secs: Option<u64>,
}

/// Command-line flags for the hub binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Chatline push-channel hub")]
pub struct RelayCliArgs {
    /// Socket address to listen on.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub listen: Option<String>,

    /// Alternate config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest accepted frame, in bytes.
    #[arg(long)]
    pub max_frame_bytes: Option<usize>,

    /// Frames buffered per connection before deliveries are dropped.
    #[arg(long, env = "RELAY_OUTBOUND_QUEUE")]
    pub outbound_queue: Option<usize>,

    /// Seconds a new connection has to send `add-user`.
    #[arg(long)]
    pub register_timeout_secs: Option<u64>,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

/// Everything the hub binary needs to start.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: String,
    pub hub: HubSettings,
    pub log_level: String,
}

impl RelayConfig {
    /// Reads the config file (explicit or default location) and layers the
    /// flags over it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit file is missing, any file fails
    /// to parse, or a limit resolves to zero.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => read_file(path)?,
            None => read_default_file()?,
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &RelayCliArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let base = HubSettings::default();
        let limits = file.limits;

        let hub = HubSettings {
            max_payload_size: nonzero(
                "max_frame_bytes",
                cli.max_frame_bytes.or(limits.max_frame_bytes),
                base.max_payload_size,
            )?,
            outbound_queue: nonzero(
                "outbound_queue",
                cli.outbound_queue.or(limits.outbound_queue),
                base.outbound_queue,
            )?,
            register_timeout: match cli.register_timeout_secs.or(limits.register_timeout_secs) {
                Some(0) => return Err(ConfigError::Zero { field: "register_timeout_secs" }),
                Some(secs) => Duration::from_secs(secs),
                None => base.register_timeout,
            },
        };

        Ok(Self {
            listen: cli
                .listen
                .clone()
                .or(file.listen)
                .unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            hub,
            log_level: cli.log_level.clone(),
        })
    }
}

fn nonzero(field: &'static str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Zero { field }),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// A missing default file is the same as an empty one.
fn read_default_file() -> Result<FileConfig, ConfigError> {
    let Some(dir) = dirs::config_dir() else {
        return Ok(FileConfig::default());
    };
    let path = dir.join("chatline-relay").join("config.toml");
    match read_file(&path) {
        Err(ConfigError::ReadFile { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(FileConfig::default())
        }
        other => other,
    }
}
