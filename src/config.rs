//! Configuration module for the fetchd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the file server
#[derive(Parser, Debug)]
#[command(name = "fetchd")]
#[command(author = "fetchd authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded file retrieval server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    #[arg(value_name = "PORT", conflicts_with = "port")]
    pub port_arg: Option<u16>,

    /// Port to listen on (same as the positional argument)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (defaults to all interfaces)
    #[arg(long)]
    pub host: Option<String>,

    /// Length of the pending connection queue
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Bytes streamed per write-readiness event
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Longest accepted request path in bytes
    #[arg(long)]
    pub max_path_len: Option<usize>,

    /// Deadline for receiving a complete request, in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Deadline for streaming the response, in milliseconds
    #[arg(long)]
    pub response_timeout_ms: Option<u64>,

    /// Interval between idle-connection sweeps in milliseconds (0 disables)
    #[arg(long)]
    pub sweep_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection table configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Capacity of the readiness event buffer handed to each poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Request and response sizing
#[derive(Debug, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_path_len: default_max_path_len(),
        }
    }
}

/// Per-phase deadlines
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_ms")]
    pub request_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub response_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: default_timeout_ms(),
            response_ms: default_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2013
}

fn default_backlog() -> i32 {
    100
}

fn default_max_connections() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_chunk_size() -> usize {
    8 * 1024
}

fn default_max_path_len() -> usize {
    256
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Largest accepted `max_path_len`, the usual `PATH_MAX`.
pub const MAX_PATH_LEN_LIMIT: usize = 4096;

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub chunk_size: usize,
    pub max_path_len: usize,
    pub request_timeout: Duration,
    pub response_timeout: Duration,
    /// `None` leaves deadlines to be checked only when a socket becomes ready.
    pub sweep_interval: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments, reading the TOML file they name.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let sweep_ms = cli
            .sweep_interval_ms
            .unwrap_or(toml_config.timeouts.sweep_interval_ms);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli
                .port_arg
                .or(cli.port)
                .unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            events_capacity: toml_config.server.events_capacity,
            chunk_size: cli.chunk_size.unwrap_or(toml_config.transfer.chunk_size),
            max_path_len: cli
                .max_path_len
                .unwrap_or(toml_config.transfer.max_path_len),
            request_timeout: Duration::from_millis(
                cli.request_timeout_ms
                    .unwrap_or(toml_config.timeouts.request_ms),
            ),
            response_timeout: Duration::from_millis(
                cli.response_timeout_ms
                    .unwrap_or(toml_config.timeouts.response_ms),
            ),
            sweep_interval: (sweep_ms > 0).then(|| Duration::from_millis(sweep_ms)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0"));
        }
        if self.max_path_len == 0 {
            return Err(ConfigError::Invalid("max_path_len must be greater than 0"));
        }
        if self.max_path_len > MAX_PATH_LEN_LIMIT {
            return Err(ConfigError::Invalid("max_path_len must be at most 4096"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0",
            ));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid(
                "events_capacity must be greater than 0",
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0"));
        }
        Ok(())
    }
}

impl CliArgs {
    fn empty() -> Self {
        CliArgs {
            port_arg: None,
            port: None,
            config: None,
            host: None,
            backlog: None,
            max_connections: None,
            chunk_size: None,
            max_path_len: None,
            request_timeout_ms: None,
            response_timeout_ms: None,
            sweep_interval_ms: None,
            log_level: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
