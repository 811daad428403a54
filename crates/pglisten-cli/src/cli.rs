//! CLI argument parsing for the pglisten binary
//!
//! Flags override values loaded from `--config`.

use clap::{Parser, ValueEnum};
use pglisten::config::{AuthFailurePolicy, ListenerConfig, PayloadFormat};
use std::path::PathBuf;
use std::time::Duration;

/// Print notifications from PostgreSQL channels, reconnecting as needed
#[derive(Parser, Debug)]
#[command(name = "pglisten")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "PGLISTEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database host [default: localhost]
    #[arg(long, env = "PGLISTEN_HOST")]
    pub host: Option<String>,

    /// Database port [default: 5432]
    #[arg(short, long, env = "PGLISTEN_PORT")]
    pub port: Option<u16>,

    /// Login role [default: postgres]
    #[arg(short, long, env = "PGLISTEN_USER")]
    pub user: Option<String>,

    /// Login password
    #[arg(long, env = "PGLISTEN_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database name [default: weather]
    #[arg(short, long, env = "PGLISTEN_DATABASE")]
    pub database: Option<String>,

    /// Channels to listen on (repeatable or comma-separated) [default: observations]
    #[arg(long = "channel", value_delimiter = ',', env = "PGLISTEN_CHANNELS")]
    pub channels: Vec<String>,

    /// Payload validation
    #[arg(long, value_enum, env = "PGLISTEN_FORMAT")]
    pub format: Option<FormatArg>,

    /// How notifications are printed
    #[arg(long, value_enum, default_value = "text", env = "PGLISTEN_OUTPUT")]
    pub output: OutputFormat,

    /// Delivery queue capacity
    #[arg(long, env = "PGLISTEN_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Stop instead of retrying when the server rejects the credentials
    #[arg(long, env = "PGLISTEN_AUTH_FATAL")]
    pub auth_fatal: bool,

    /// Seconds to wait for a clean shutdown
    #[arg(long, default_value = "10", env = "PGLISTEN_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

/// Payload validation applied before delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// UTF-8 text
    Text,
    /// JSON documents
    Json,
    /// Anything
    Binary,
}

impl From<FormatArg> for PayloadFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Text => PayloadFormat::Text,
            FormatArg::Json => PayloadFormat::Json,
            FormatArg::Binary => PayloadFormat::Binary,
        }
    }
}

/// Output rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One human readable line per notification
    Text,
    /// One JSON object per line
    Json,
}

impl Cli {
    /// Build the listener configuration
    pub fn listener_config(&self) -> anyhow::Result<ListenerConfig> {
        let mut config = match &self.config {
            Some(path) => ListenerConfig::from_file(path)?,
            None => ListenerConfig::new("localhost", "weather"),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }
        if let Some(password) = &self.password {
            config.password = password.as_str().into();
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if !self.channels.is_empty() {
            config.channels = self
                .channels
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if config.channels.is_empty() {
            config.channels.push("observations".to_string());
        }
        if let Some(format) = self.format {
            config.payload_format = format.into();
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue.capacity = capacity;
        }
        if self.auth_fatal {
            config.auth_failure_policy = AuthFailurePolicy::Fatal;
        }

        config.validate()?;
        Ok(config)
    }

    /// Grace period for `stop()`
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}
