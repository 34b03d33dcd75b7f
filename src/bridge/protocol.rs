//! Wire protocol for the worker bridge.
//!
//! Messages are newline-delimited JSON objects tagged with
//! `"jsonrpc": "2.0"`. This module owns the message types, the id types and
//! the line codec.

mod codec;
mod message;
mod message_id;

pub(crate) use codec::{Decoded, decode_line};
pub use codec::encode;
pub use message::{ErrorObject, Message, Request, Response};
pub use message_id::{CallId, MessageId};

/// Protocol version tag written on every outbound message.
pub const PROTOCOL_VERSION: &str = "2.0";
