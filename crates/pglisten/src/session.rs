//! Session abstractions
//!
//! A session owns exactly one database connection for one connection attempt:
//! - [`Connector`]: performs the handshake and hands back a fresh session
//! - [`Session`]: runs control commands and exposes the inbound event stream
//! - [`EventStream`]: infinite while connected, ends with a terminal error
//!
//! Sessions are never reused. After the stream terminates or `close()` is
//! called, the reconnection controller asks the connector for a new one.

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::notification::{quote_identifier, RawEvent};

/// Inbound events of one session
pub type EventStream = BoxStream<'static, Result<RawEvent>>;

/// Control commands understood by a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Start receiving notifications for a channel
    Listen(String),
    /// Stop receiving notifications for a channel
    Unlisten(String),
    /// Stop receiving notifications for every channel
    UnlistenAll,
    /// Round trip used as a health check
    Ping,
}

impl Command {
    /// Render the command as SQL
    pub fn to_sql(&self) -> String {
        match self {
            Self::Listen(channel) => format!("LISTEN {}", quote_identifier(channel)),
            Self::Unlisten(channel) => format!("UNLISTEN {}", quote_identifier(channel)),
            Self::UnlistenAll => "UNLISTEN *".to_string(),
            Self::Ping => "SELECT 1".to_string(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// Connection state of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No handshake attempted yet, or closed
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake succeeded
    Connected,
    /// Handshake or connection failed
    Failed,
}

impl SessionState {
    /// Whether `self -> next` is allowed within one connection attempt
    ///
    /// Attempts only move forward; closing is always allowed.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Failed)
                | (_, Disconnected)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Session state plus the last error, guarded for use from several tasks
#[derive(Debug)]
pub struct SessionStatus {
    inner: Mutex<(SessionState, Option<String>)>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            inner: Mutex::new((SessionState::Disconnected, None)),
        }
    }
}

impl SessionStatus {
    /// Create a status already in `state`
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Mutex::new((state, None)),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.lock().0
    }

    /// Last recorded error
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().1.clone()
    }

    /// Move to `next` if allowed; returns whether the state changed
    pub fn transition(&self, next: SessionState) -> bool {
        let mut guard = self.inner.lock();
        if guard.0 == next || !guard.0.can_transition_to(next) {
            return false;
        }
        guard.0 = next;
        true
    }

    /// Record a failure
    pub fn fail(&self, error: impl Into<String>) {
        let mut guard = self.inner.lock();
        if guard.0.can_transition_to(SessionState::Failed) {
            guard.0 = SessionState::Failed;
        }
        guard.1 = Some(error.into());
    }
}

/// One live connection to the database
#[async_trait]
pub trait Session: Send + Sync {
    /// Current connection state
    fn state(&self) -> SessionState;

    /// Last error observed on this session
    fn last_error(&self) -> Option<String>;

    /// Send a control command and wait for its acknowledgment
    async fn execute(&self, command: &Command) -> Result<()>;

    /// Take the inbound event stream
    ///
    /// Only the first call succeeds.
    fn take_events(&self) -> Result<EventStream>;

    /// Release the connection
    async fn close(&self) -> Result<()>;

    /// Whether `close()` has been called
    fn is_closed(&self) -> bool;
}

/// Creates sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the network/auth handshake
    async fn connect(&self, config: &ListenerConfig) -> Result<Box<dyn Session>>;

    /// Backend name, for logs
    fn name(&self) -> &'static str;
}
