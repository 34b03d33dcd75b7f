//! Actor components for the worker connection.
//!
//! # Components
//!
//! - `Reader`: background task that frames a worker output stream into lines
//! - `Writer`: single task that owns the worker's stdin and writes queued lines

mod outbound_message;
mod reader;
mod writer;

pub(crate) use outbound_message::OutboundMessage;
pub(crate) use reader::{ReaderTaskHandle, spawn_reader_task};
pub(crate) use writer::{OUTBOUND_QUEUE_CAPACITY, WriterTaskHandle, spawn_writer_task};
