//! Notification events
//!
//! A [`RawEvent`] is what a session hands over from the wire. The dispatcher
//! validates it against the configured [`PayloadFormat`] and stamps it with a
//! per-listener sequence number, producing an immutable [`Notification`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::config::PayloadFormat;
use crate::error::{Error, Result};

/// PostgreSQL identifiers are truncated at NAMEDATALEN - 1 bytes
pub const MAX_CHANNEL_NAME_LEN: usize = 63;

/// One undecoded asynchronous event frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Channel the event was published on
    pub channel: String,
    /// Opaque payload
    pub payload: Bytes,
    /// Backend process id of the notifying session, if known
    pub origin: Option<i32>,
}

impl RawEvent {
    /// Create a raw event without an origin
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            origin: None,
        }
    }

    /// Set the origin
    pub fn with_origin(mut self, origin: i32) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// A decoded, sequenced notification delivered to consumers
///
/// Serializes with the payload as text when it is valid UTF-8 and as hex
/// otherwise; `payload_encoding` (`"utf8"` or `"hex"`) says which.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification arrived on
    pub channel: String,
    /// Payload bytes, exactly as received
    pub payload: Bytes,
    /// Backend process id of the notifying session
    pub origin: Option<i32>,
    /// Monotonic per-listener sequence number, starting at 1
    pub sequence: u64,
    /// When the dispatcher decoded the event
    pub received_at: DateTime<Utc>,
}

impl Notification {
    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload parsed as JSON
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::decode(&self.channel, format!("invalid JSON payload: {}", e)))
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let (payload, encoding) = match self.payload_str() {
            Some(text) => (text.to_string(), "utf8"),
            None => (hex::encode(&self.payload), "hex"),
        };
        let mut state = serializer.serialize_struct("Notification", 6)?;
        state.serialize_field("channel", &self.channel)?;
        state.serialize_field("payload", &payload)?;
        state.serialize_field("payload_encoding", encoding)?;
        state.serialize_field("origin", &self.origin)?;
        state.serialize_field("sequence", &self.sequence)?;
        state.serialize_field("received_at", &self.received_at)?;
        state.end()
    }
}

/// Validate a raw event and turn it into a [`Notification`]
pub fn decode(raw: RawEvent, format: PayloadFormat, sequence: u64) -> Result<Notification> {
    if raw.channel.is_empty() {
        return Err(Error::decode("", "channel name is empty"));
    }

    match format {
        PayloadFormat::Text => {
            if let Err(e) = std::str::from_utf8(&raw.payload) {
                return Err(Error::decode(
                    &raw.channel,
                    format!("payload is not valid UTF-8: {}", e),
                ));
            }
        }
        PayloadFormat::Json => {
            if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(&raw.payload) {
                return Err(Error::decode(
                    &raw.channel,
                    format!("payload is not valid JSON: {}", e),
                ));
            }
        }
        PayloadFormat::Binary => {}
    }

    Ok(Notification {
        channel: raw.channel,
        payload: raw.payload,
        origin: raw.origin,
        sequence,
        received_at: Utc::now(),
    })
}

/// Check that `name` can be used as a channel
pub fn validate_channel_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("channel name must not be empty"));
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(Error::config(format!(
            "channel name '{}' exceeds {} bytes",
            name, MAX_CHANNEL_NAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(Error::config("channel name must not contain NUL"));
    }
    Ok(())
}

/// Quote a channel name as a SQL identifier
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
