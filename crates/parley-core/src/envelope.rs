//! Chat message envelopes.
//!
//! Every message on the wire is a JSON object `{timestamp, sender, content}`.
//! The server keeps a richer [`LogEntry`] that also records the sender's IP;
//! that field never leaves the process.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EnvelopeError;

/// Sender name used for server-authored messages.
pub const SERVER_SENDER: &str = "Server";

pub const UNKNOWN_TIME: &str = "Unknown Time";
pub const UNKNOWN_SENDER: &str = "Unknown Sender";
pub const UNKNOWN_CONTENT: &str = "Unknown Content";
pub const UNKNOWN_IP: &str = "Unknown IP";

/// Client-visible message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: String,
    pub sender: String,
    pub content: String,
}

impl Envelope {
    pub fn new(
        timestamp: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            sender: sender.into(),
            content: content.into(),
        }
    }

    /// Parse a raw JSON object. Missing or non-string fields fall back to
    /// the "Unknown …" sentinels.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let obj = parse_object(raw)?;
        Ok(Self::from_fields(&obj, UNKNOWN_TIME, UNKNOWN_SENDER))
    }

    /// Build the envelope for a frame received from a client.
    ///
    /// A JSON object is read as an envelope whose missing `sender` is the
    /// connection identifier and whose missing `timestamp` is now. Anything
    /// else is taken verbatim as the content.
    pub fn from_inbound(raw: &str, identifier: &str) -> Self {
        match parse_object(raw) {
            Ok(obj) => Self::from_fields(&obj, &now_timestamp(), identifier),
            Err(_) => Self::new(now_timestamp(), identifier, raw),
        }
    }

    /// Server-authored envelope stamped with the current time.
    pub fn server(content: impl Into<String>) -> Self {
        Self::new(now_timestamp(), SERVER_SENDER, content)
    }

    /// Attach the resolved sender IP for the server-side log.
    pub fn into_log_entry(self, ip: impl Into<String>) -> LogEntry {
        LogEntry {
            timestamp: self.timestamp,
            sender: self.sender,
            content: self.content,
            ip: ip.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "timestamp": self.timestamp,
            "sender": self.sender,
            "content": self.content,
        })
        .to_string()
    }

    fn from_fields(obj: &Map<String, Value>, timestamp: &str, sender: &str) -> Self {
        let field = |key: &str, default: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Self {
            timestamp: field("timestamp", timestamp),
            sender: field("sender", sender),
            content: field("content", UNKNOWN_CONTENT),
        }
    }
}

/// Server-side record of a message, including the sender's IP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub sender: String,
    pub content: String,
    pub ip: String,
}

impl LogEntry {
    /// Strip the server-only fields.
    pub fn envelope(&self) -> Envelope {
        Envelope::new(&self.timestamp, &self.sender, &self.content)
    }
}

/// RFC 3339 UTC timestamp with second precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, EnvelopeError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(EnvelopeError::NotAnObject("array")),
        Value::String(_) => Err(EnvelopeError::NotAnObject("string")),
        Value::Number(_) => Err(EnvelopeError::NotAnObject("number")),
        Value::Bool(_) => Err(EnvelopeError::NotAnObject("bool")),
        Value::Null => Err(EnvelopeError::NotAnObject("null")),
    }
}
