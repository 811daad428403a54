//! # pglisten
//!
//! Durable PostgreSQL `LISTEN`/`NOTIFY` listener.
//!
//! A plain `LISTEN` on a single connection stops delivering the moment that
//! connection drops. This crate keeps listening across outages:
//!
//! - **Reconnection**: exponential backoff with jitter, reset once a session
//!   stays up past a stability window; authentication failures can be made fatal
//! - **Subscription replay**: the consumer's channel set is re-issued, in
//!   insertion order, on every new session
//! - **Bounded delivery**: callbacks run off the network read loop behind a
//!   bounded queue (drop-oldest by default) with a dropped-event counter
//! - **Ordering**: every callback sees notifications in arrival order, tagged
//!   with a per-listener sequence number
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pglisten::prelude::*;
//!
//! let config = ListenerConfig::from_file("pglisten.yaml")?;
//! let listener = Listener::new(config)?;
//!
//! listener.on_notification(|n| println!("{}: {:?}", n.channel, n.payload_str()));
//! listener.on_error(|e| eprintln!("listener error: {}", e));
//! listener.start()?;
//!
//! tokio::signal::ctrl_c().await?;
//! listener.stop().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod listener;
pub mod notification;
pub mod postgres;
pub mod session;
pub mod subscription;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        AuthFailurePolicy, BackoffConfig, ListenerConfig, OverflowPolicy, PayloadFormat,
        QueueConfig, SensitiveString, TimeoutConfig,
    };
    pub use crate::controller::ListenerState;
    pub use crate::error::{ConnectErrorKind, Error, ErrorCategory, Result};
    pub use crate::listener::{Listener, ListenerStats};
    pub use crate::notification::{Notification, RawEvent};
    pub use crate::session::{Command, Connector, EventStream, Session, SessionState};
}

pub use config::ListenerConfig;
pub use controller::ListenerState;
pub use error::{Error, Result};
pub use listener::{Listener, ListenerStats};
pub use notification::Notification;
