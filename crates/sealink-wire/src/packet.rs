//! Application message contract.
//!
//! The engine treats payloads as opaque: a message only has to say whether
//! the application layer signed it off, and serialize to JSON. [`AppPacket`]
//! is a ready-made general-purpose implementation.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Anything that can travel over a connection.
pub trait Packet: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Whether the application validated this message for sending.
    /// Unsigned messages are rejected before they reach the wire.
    fn is_signed(&self) -> bool;

    /// Called once, right before the message is encoded for sending.
    fn on_before_send(&mut self) {}
}

/// A general-purpose packet: a kind tag plus a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppPacket {
    /// Message type, e.g. `"ping"`.
    pub kind: String,
    /// Arbitrary payload.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Set by [`AppPacket::sign`].
    #[serde(default)]
    pub signed: bool,
    /// Stamped when the packet is handed to the socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl AppPacket {
    /// Create an unsigned packet with an empty body.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            body: serde_json::Value::Null,
            signed: false,
            sent_at: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Mark the packet as validated for sending.
    pub fn sign(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Compare kind and body, ignoring send bookkeeping.
    pub fn same_content(&self, other: &AppPacket) -> bool {
        self.kind == other.kind && self.body == other.body
    }
}

impl Packet for AppPacket {
    fn is_signed(&self) -> bool {
        self.signed
    }

    fn on_before_send(&mut self) {
        self.sent_at = Some(Utc::now());
    }
}
