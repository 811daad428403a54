//! Error types for pglisten
//!
//! Errors are classified so the reconnection controller can decide what to do:
//! - Connection errors are retried with backoff (authentication is policy-driven)
//! - Command errors are reported and retried on the next reconnection
//! - Stream termination triggers a reconnect
//! - Decode and overflow errors are counted and never stop the stream

use std::fmt;
use thiserror::Error;

/// Result type for pglisten operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    /// Host unreachable, refused, DNS failure
    Unreachable,
    /// Credentials rejected by the server
    Authentication,
    /// TLS negotiation failed
    Tls,
    /// Startup/protocol negotiation failed
    Protocol,
    /// Handshake did not finish within the connect timeout
    Timeout,
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::Authentication => write!(f, "authentication"),
            Self::Tls => write!(f, "tls"),
            Self::Protocol => write!(f, "protocol"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Error categories for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection establishment (retriable)
    Connection,
    /// Control command rejected
    Command,
    /// Event stream ended (retriable)
    Stream,
    /// Malformed notification
    Decode,
    /// Consumer queue overflowed
    Overflow,
    /// Operation timed out (retriable)
    Timeout,
    /// Invalid configuration
    Configuration,
    /// Listener lifecycle misuse or shutdown
    Lifecycle,
}

impl ErrorCategory {
    /// Whether errors in this category are recovered by reconnecting
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Stream | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Command => write!(f, "command"),
            Self::Stream => write!(f, "stream"),
            Self::Decode => write!(f, "decode"),
            Self::Overflow => write!(f, "overflow"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
        }
    }
}

/// Main error type for pglisten
#[derive(Error, Debug)]
pub enum Error {
    /// Connection attempt failed
    #[error("connect error ({kind}): {message}")]
    Connect {
        /// Failure cause
        kind: ConnectErrorKind,
        /// Human readable description
        message: String,
        /// Underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Control command was rejected or could not be sent
    #[error("command `{command}` failed: {message}")]
    Command {
        /// Rendered command
        command: String,
        /// Human readable description
        message: String,
        /// Set when the failure means the connection itself is gone
        connection_lost: bool,
        /// Underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The session's event stream ended
    #[error("event stream terminated: {reason}")]
    StreamTerminated {
        /// Why the stream ended
        reason: String,
    },

    /// A notification could not be decoded
    #[error("malformed notification on channel '{channel}': {message}")]
    Decode {
        /// Channel the event arrived on (may be empty)
        channel: String,
        /// What was wrong with it
        message: String,
    },

    /// The delivery queue was full and events were discarded
    #[error("delivery queue overflow: {dropped} event(s) dropped")]
    QueueOverflow {
        /// Number of events dropped by this overflow
        dropped: u64,
    },

    /// Operation timed out
    #[error("timeout: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// The listener is shutting down or stopped
    #[error("listener is shut down")]
    Shutdown,

    /// `start()` was called twice
    #[error("listener already started")]
    AlreadyStarted,

    /// An operation needed a running listener or an attached session
    #[error("not running: {message}")]
    NotRunning {
        /// What was attempted
        message: String,
    },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connect {
                kind: ConnectErrorKind::Timeout,
                ..
            } => ErrorCategory::Timeout,
            Self::Connect { .. } => ErrorCategory::Connection,
            Self::Command { .. } => ErrorCategory::Command,
            Self::StreamTerminated { .. } => ErrorCategory::Stream,
            Self::Decode { .. } => ErrorCategory::Decode,
            Self::QueueOverflow { .. } => ErrorCategory::Overflow,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Shutdown | Self::AlreadyStarted | Self::NotRunning { .. } => {
                ErrorCategory::Lifecycle
            }
        }
    }

    /// Whether this error is recovered by reconnecting
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means the current session is unusable
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Command {
                connection_lost, ..
            } => *connection_lost,
            Self::StreamTerminated { .. } | Self::Connect { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether the server rejected our credentials
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::Connect {
                kind: ConnectErrorKind::Authentication,
                ..
            }
        )
    }

    /// Create a connect error
    pub fn connect(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self::Connect {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a connect error with source
    pub fn connect_with_source(
        kind: ConnectErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connect {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a command error that leaves the session usable
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
            connection_lost: false,
            source: None,
        }
    }

    /// Create a command error caused by a dead connection
    pub fn command_connection_lost(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
            connection_lost: true,
            source: None,
        }
    }

    /// Create a stream termination error
    pub fn stream_terminated(reason: impl Into<String>) -> Self {
        Self::StreamTerminated {
            reason: reason.into(),
        }
    }

    /// Create a decode error
    pub fn decode(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a not-running error
    pub fn not_running(message: impl Into<String>) -> Self {
        Self::NotRunning {
            message: message.into(),
        }
    }

    /// Classify a driver error raised while connecting
    pub fn from_pg_connect(err: tokio_postgres::Error) -> Self {
        let kind = classify_pg_connect(&err);
        Self::connect_with_source(kind, err.to_string(), err)
    }

    /// Classify a driver error raised while running `command`
    pub fn from_pg_command(command: impl Into<String>, err: tokio_postgres::Error) -> Self {
        let connection_lost = err.is_closed() || io_source(&err).is_some();
        Self::Command {
            command: command.into(),
            message: err.to_string(),
            connection_lost,
            source: Some(Box::new(err)),
        }
    }
}

fn classify_pg_connect(err: &tokio_postgres::Error) -> ConnectErrorKind {
    if let Some(state) = err.code() {
        // Class 28: invalid authorization specification
        if state.code().starts_with("28") {
            return ConnectErrorKind::Authentication;
        }
        return ConnectErrorKind::Protocol;
    }
    if io_source(err).is_some() {
        ConnectErrorKind::Unreachable
    } else {
        ConnectErrorKind::Protocol
    }
}

fn io_source(err: &tokio_postgres::Error) -> Option<&std::io::Error> {
    std::error::Error::source(err).and_then(|s| s.downcast_ref::<std::io::Error>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Connection.is_retriable());
        assert!(ErrorCategory::Stream.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());

        assert!(!ErrorCategory::Command.is_retriable());
        assert!(!ErrorCategory::Decode.is_retriable());
        assert!(!ErrorCategory::Overflow.is_retriable());
        assert!(!ErrorCategory::Configuration.is_retriable());
    }

    #[test]
    fn test_connect_timeout_is_timeout_category() {
        let err = Error::connect(ConnectErrorKind::Timeout, "handshake");
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(err.is_retriable());
        assert!(!err.is_authentication());
    }

    #[test]
    fn test_authentication_error() {
        let err = Error::connect(ConnectErrorKind::Authentication, "password rejected");
        assert!(err.is_authentication());
        assert!(err.is_retriable());
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn test_command_connection_lost() {
        assert!(!Error::command("LISTEN \"a\"", "denied").is_connection_lost());
        assert!(Error::command_connection_lost("LISTEN \"a\"", "closed").is_connection_lost());
        assert!(Error::stream_terminated("eof").is_connection_lost());
        assert!(!Error::decode("a", "bad").is_connection_lost());
    }

    #[test]
    fn test_error_display() {
        let err = Error::decode("observations", "payload is not valid UTF-8");
        let msg = err.to_string();
        assert!(msg.contains("observations"));
        assert!(msg.contains("UTF-8"));

        let err = Error::QueueOverflow { dropped: 3 };
        assert_eq!(err.to_string(), "delivery queue overflow: 3 event(s) dropped");
    }
}
