//! Typed bridge messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CallId, MessageId};

/// A message travelling in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request or notification (no `id`)
    Request(Request),
    Response(Response),
}

/// Method invocation. Without an `id` it is a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<MessageId>,
    pub method: String,
    pub params: Value,
    /// Outer call whose deadline covers this request (timeout bumping)
    pub call_id: Option<CallId>,
    /// Time budget the sender gives this request
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn new(id: MessageId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params,
            call_id: None,
            timeout_ms: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
            call_id: None,
            timeout_ms: None,
        }
    }

    pub fn with_budget(mut self, call_id: CallId, timeout_ms: u64) -> Self {
        self.call_id = Some(call_id);
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Answer to exactly one prior request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: MessageId,
    pub outcome: Result<Value, ErrorObject>,
}

impl Response {
    pub fn success(id: MessageId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: MessageId, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

/// Payload of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }
}
