//! Outbound message types for the writer loop.
//!
//! Every line bound for the worker's stdin passes through one queue, so
//! lines are written whole and in the order they were queued.

use tokio::sync::oneshot;

use crate::bridge::protocol::MessageId;

/// Encoded line waiting to be written to the worker.
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    /// Fire-and-forget notification.
    Notification(String),

    /// Host request. The id is already registered with the correlation
    /// table; a failed write rejects exactly this call.
    Request { line: String, id: MessageId },

    /// Answer to a request the worker made.
    Response(String),

    /// Marker with nothing to write. Acknowledged once every message queued
    /// ahead of it has been written (or has failed).
    Flush(oneshot::Sender<()>),
}

impl OutboundMessage {
    /// The newline-terminated line to write; `None` for a flush marker.
    pub(crate) fn line(&self) -> Option<&str> {
        match self {
            OutboundMessage::Notification(line) => Some(line),
            OutboundMessage::Request { line, .. } => Some(line),
            OutboundMessage::Response(line) => Some(line),
            OutboundMessage::Flush(_) => None,
        }
    }
}
