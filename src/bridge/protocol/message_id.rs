//! Identifier types for bridge messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id pairing a Request with its Response.
///
/// The wire allows either a number or a string. Ids issued by the host are
/// always numeric; ids issued by the worker are echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl MessageId {
    /// Extract an id from its JSON representation.
    ///
    /// Returns `None` for anything but an integer or a string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(MessageId::Number),
            Value::String(s) => Some(MessageId::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MessageId::Number(n) => Value::from(*n),
            MessageId::String(s) => Value::from(s.as_str()),
        }
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        MessageId::Number(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        MessageId::String(id.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{}", n),
            MessageId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// Token naming an outstanding host call whose deadline may be extended.
///
/// Sent as `callId` on every outward request. A worker that calls back into
/// the host while handling that request echoes it, so the host knows which
/// deadline to push out while it serves the nested call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh, unique call id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
