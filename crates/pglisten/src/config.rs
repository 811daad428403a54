//! Listener configuration
//!
//! Configuration can be built in code or loaded from YAML. Values of the form
//! `${VAR}` or `${VAR:-default}` are expanded from the environment before parsing:
//!
//! ```yaml
//! host: db.internal
//! database: weather
//! user: postgres
//! password: ${PGPASSWORD}
//! channels: [observations]
//! backoff:
//!   base_delay_ms: 250
//!   max_delay_ms: 30000
//! queue:
//!   capacity: 100
//!   overflow: drop_oldest
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::notification::validate_channel_name;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Wrapper for sensitive configuration values
///
/// Prevents accidental logging of secrets while allowing access when needed.
#[derive(Debug, Clone)]
pub struct SensitiveString(SecretString);

impl Default for SensitiveString {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl SensitiveString {
    /// Create a new sensitive string
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret value
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// What to do when the delivery queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room (stale data loses value)
    #[default]
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}

/// How notification payloads are validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Payload must be valid UTF-8
    #[default]
    Text,
    /// Payload must be a valid JSON document
    Json,
    /// Payload is opaque bytes
    Binary,
}

/// How authentication failures are treated by the reconnection controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailurePolicy {
    /// Retry with backoff like any other connect failure
    #[default]
    Retry,
    /// Stop retrying and report a terminal failure
    Fatal,
}

/// Reconnection backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base_delay_ms: u64,
    /// Delay ceiling
    pub max_delay_ms: u64,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Jitter fraction (0.0 - 1.0) applied symmetrically around the delay
    pub jitter: f64,
    /// A connection that stays up this long resets the backoff
    pub stability_window_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.25,
            stability_window_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay after the first failure
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay ceiling
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Stability window
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }
}

/// Independent per-operation timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection handshake timeout
    pub connect_ms: u64,
    /// Per-command acknowledgment timeout
    pub command_ms: u64,
    /// Health-check round trip timeout
    pub health_check_ms: u64,
    /// Interval between health checks (0 disables them)
    pub health_check_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            command_ms: 5_000,
            health_check_ms: 5_000,
            health_check_interval_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    /// Connection handshake timeout
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Per-command timeout
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    /// Health-check timeout
    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    /// Health-check interval, `None` when disabled
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }
}

/// Delivery queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued, undelivered notifications
    pub capacity: usize,
    /// Overflow policy
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Root listener configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Login role
    pub user: String,
    /// Login password
    pub password: SensitiveString,
    /// Database name
    pub database: String,
    /// Reported in pg_stat_activity
    pub application_name: Option<String>,
    /// Channels subscribed at startup
    pub channels: Vec<String>,
    /// Reconnection backoff
    pub backoff: BackoffConfig,
    /// Operation timeouts
    pub timeouts: TimeoutConfig,
    /// Delivery queue
    pub queue: QueueConfig,
    /// Payload validation
    pub payload_format: PayloadFormat,
    /// Authentication failure handling
    pub auth_failure_policy: AuthFailurePolicy,
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("channels", &self.channels)
            .field("backoff", &self.backoff)
            .field("timeouts", &self.timeouts)
            .field("queue", &self.queue)
            .field("payload_format", &self.payload_format)
            .field("auth_failure_policy", &self.auth_failure_policy)
            .finish()
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: SensitiveString::default(),
            database: "postgres".to_string(),
            application_name: Some("pglisten".to_string()),
            channels: Vec::new(),
            backoff: BackoffConfig::default(),
            timeouts: TimeoutConfig::default(),
            queue: QueueConfig::default(),
            payload_format: PayloadFormat::default(),
            auth_failure_policy: AuthFailurePolicy::default(),
        }
    }
}

impl ListenerConfig {
    /// Create configuration for a host and database
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set login credentials
    pub fn with_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<SensitiveString>,
    ) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Add a startup channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    /// Set backoff parameters
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set timeouts
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set delivery queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue.capacity = capacity;
        self
    }

    /// Set delivery queue overflow policy
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.queue.overflow = policy;
        self
    }

    /// Set payload validation
    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }

    /// Set authentication failure policy
    pub fn with_auth_failure_policy(mut self, policy: AuthFailurePolicy) -> Self {
        self.auth_failure_policy = policy;
        self
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("port must be non-zero"));
        }
        if self.database.trim().is_empty() {
            return Err(Error::config("database must not be empty"));
        }
        if self.queue.capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }

        let backoff = &self.backoff;
        if backoff.base_delay_ms == 0 {
            return Err(Error::config("backoff base delay must be non-zero"));
        }
        if backoff.base_delay_ms > backoff.max_delay_ms {
            return Err(Error::config(format!(
                "backoff base delay ({}ms) exceeds max delay ({}ms)",
                backoff.base_delay_ms, backoff.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return Err(Error::config("backoff jitter must be within [0.0, 1.0]"));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(Error::config("backoff multiplier must be >= 1.0"));
        }

        let timeouts = &self.timeouts;
        if timeouts.connect_ms == 0 || timeouts.command_ms == 0 || timeouts.health_check_ms == 0 {
            return Err(Error::config("timeouts must be non-zero"));
        }

        for channel in &self.channels {
            validate_channel_name(channel)?;
        }
        Ok(())
    }

    /// Build the driver configuration
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.database)
            .connect_timeout(self.timeouts.connect());
        if !self.password.is_empty() {
            pg.password(self.password.expose_secret());
        }
        if let Some(name) = &self.application_name {
            pg.application_name(name);
        }
        pg
    }

    /// `host:port/database`, for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
