//! Error handling types for tsunagi
//!
//! This module provides the error types shared by the bridge, the method
//! dispatcher and the configuration layer.

use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced to callers of the bridge.
///
/// Every failed `send_request` resolves to exactly one of these. Transport
/// and process failures never escape as panics; they end up here or in the
/// log.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No worker process is currently running
    #[error("worker is not running")]
    NotRunning,

    /// The call's deadline elapsed without a response
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The call was cancelled in bulk (stop, crash, disconnect)
    #[error("request '{method}' cancelled: {reason}")]
    Cancelled { method: String, reason: String },

    /// The worker answered with an error response
    #[error("request '{method}' failed: {message}")]
    Remote {
        method: String,
        message: String,
        data: Option<Value>,
    },

    /// Writing to the worker failed
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Too many calls are pending on this worker
    #[error("too many pending calls (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// The worker process could not be spawned
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The one-time preparation step failed
    #[error("preparation step failed: {message}")]
    Prepare { message: String },

    /// No worker command was given or configured
    #[error("no worker command configured")]
    MissingCommand,

    /// A stop arrived while the worker was still starting
    #[error("worker start cancelled by stop")]
    StartCancelled,

    /// A message could not be serialized
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        BridgeError::Transport {
            message: message.into(),
        }
    }

    /// Create a preparation error
    pub fn prepare(message: impl Into<String>) -> Self {
        BridgeError::Prepare {
            message: message.into(),
        }
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }

    /// Whether this error came from bulk cancellation (stop or crash).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled { .. })
    }
}

/// Failure reported by a locally registered method handler.
///
/// Only `message` and `data` cross the wire. The source error is kept for
/// local logging and is attached as `detail` when verbose logging is on.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    data: Option<Value>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
            source: None,
        }
    }

    /// Attach structured data for the `error.data` field.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the underlying error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn method_not_found(method: &str) -> Self {
        Self::new(format!("method not found: {}", method))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Full error chain for local diagnostics.
    pub fn detail(&self) -> String {
        let mut detail = self.message.clone();
        let mut source = self.source.as_deref().map(|s| s as &dyn std::error::Error);
        while let Some(err) = source {
            // Messages built from the source already end with its text
            let text = err.to_string();
            if !detail.ends_with(&text) {
                detail.push_str(": ");
                detail.push_str(&text);
            }
            source = err.source();
        }
        detail
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(format!("invalid params: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::new(err.to_string()).with_source(err)
    }
}

impl From<BridgeError> for HandlerError {
    fn from(err: BridgeError) -> Self {
        let data = match &err {
            BridgeError::Remote { data, .. } => data.clone(),
            _ => None,
        };
        let handler_error = HandlerError::new(err.to_string()).with_source(err);
        match data {
            Some(data) => handler_error.with_data(data),
            None => handler_error,
        }
    }
}

/// Helper trait to recover a poisoned std mutex with logging.
pub(crate) trait MutexExt<T> {
    /// Lock the mutex, recovering from poison.
    ///
    /// The context parameter identifies which operation triggered lock recovery.
    fn lock_or_recover(&self, context: &str) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_recover(&self, context: &str) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "tsunagi::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timeout_error_names_method_and_budget() {
        let err = BridgeError::Timeout {
            method: "echo".to_string(),
            timeout_ms: 50,
        };
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "request 'echo' timed out after 50ms");
    }

    #[test]
    fn handler_error_detail_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = HandlerError::new("read failed").with_source(io);
        assert_eq!(err.message(), "read failed");
        assert_eq!(err.detail(), "read failed: no such file");
    }

    #[test]
    fn detail_does_not_repeat_wrapped_message() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = HandlerError::from(io);
        assert_eq!(err.detail(), "denied");
    }

    #[test]
    fn handler_error_from_remote_keeps_data() {
        let remote = BridgeError::Remote {
            method: "inner".to_string(),
            message: "boom".to_string(),
            data: Some(json!({"code": 7})),
        };
        let err = HandlerError::from(remote);
        assert_eq!(err.data(), Some(&json!({"code": 7})));
        assert!(err.message().contains("boom"));
    }

    #[test]
    fn lock_or_recover_returns_guard_after_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let poisoner = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*mutex.lock_or_recover("test"), 1);
    }
}
