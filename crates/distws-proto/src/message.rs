//! Message types and JSON codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// WebSocket close codes used by the distribution layer.
pub mod close_codes {
    /// Normal closure.
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// The peer was rejected (e.g. failed authentication).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Unexpected server-side failure.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// The server is shutting down or restarting.
    pub const SERVICE_RESTART: u16 = 1012;
}

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Deliver `data` to connections subscribed to `topic`, or to every
    /// connection when no topic is given.
    Publish,
    /// Add `topic` to the sender's subscription patterns.
    Subscribe,
    /// Remove `topic` from the sender's subscription patterns.
    Unsubscribe,
}

impl MessageType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Publish => "publish",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
        }
    }

    /// Whether this type mutates subscriptions instead of carrying data.
    pub fn is_subscription(&self) -> bool {
        matches!(self, MessageType::Subscribe | MessageType::Unsubscribe)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message exchanged between clients, managers and the broker.
///
/// `type`, `topic` and `data` are all required on the wire; `topic` may be
/// `null`. The optional `id` is stamped by the publishing manager and used by
/// listeners to drop redelivered copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Target topic (publish) or topic pattern (subscribe/unsubscribe).
    #[serde(deserialize_with = "Option::deserialize")]
    pub topic: Option<String>,
    /// Arbitrary JSON payload.
    pub data: Value,
    /// De-duplication id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Message {
    /// Create a publish message targeting a topic.
    pub fn publish(topic: impl Into<String>, data: Value) -> Self {
        Self {
            kind: MessageType::Publish,
            topic: Some(topic.into()),
            data,
            id: None,
        }
    }

    /// Create an untargeted publish message delivered to every connection.
    pub fn broadcast(data: Value) -> Self {
        Self {
            kind: MessageType::Publish,
            topic: None,
            data,
            id: None,
        }
    }

    /// Create a subscribe message for a topic pattern.
    pub fn subscribe(pattern: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Subscribe,
            topic: Some(pattern.into()),
            data: Value::Null,
            id: None,
        }
    }

    /// Create an unsubscribe message for a topic pattern.
    pub fn unsubscribe(pattern: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Unsubscribe,
            topic: Some(pattern.into()),
            data: Value::Null,
            id: None,
        }
    }

    /// Set the de-duplication id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The topic this message targets, if any.
    ///
    /// An empty topic counts as no topic.
    pub fn target(&self) -> Option<&str> {
        self.topic.as_deref().filter(|topic| !topic.is_empty())
    }

    /// Whether this is a publish with no target topic.
    pub fn is_broadcast(&self) -> bool {
        self.kind == MessageType::Publish && self.target().is_none()
    }
}

/// Encode a message to its JSON wire form.
pub fn encode(message: &Message) -> Result<String, Error> {
    serde_json::to_string(message).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message from its JSON wire form.
///
/// Malformed JSON is a deserialization error; well-formed JSON with the wrong
/// shape (missing fields, unknown type) is an invalid message.
pub fn decode(raw: &str) -> Result<Message, Error> {
    serde_json::from_str(raw).map_err(|e| {
        if e.is_data() {
            Error::InvalidMessage(e.to_string())
        } else {
            Error::Deserialization(e.to_string())
        }
    })
}
