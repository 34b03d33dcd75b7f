//! Bidirectional RPC bridge to a supervised worker process.
//!
//! The host and the worker exchange newline-delimited JSON messages over the
//! worker's stdio. Either side may call the other; host calls carry a
//! `callId` so that a worker calling back while serving one can have the
//! outer deadline extended for as long as the nested call takes.
//!
//! # Architecture
//!
//! - `framing` / `protocol`: bytes → lines → typed messages and back
//! - `correlation`: pending host calls, their deadlines and bumping
//! - `dispatcher`: inbound worker requests → registered handlers
//! - `actor`: reader tasks for stdout/stderr, single writer task for stdin
//! - `supervisor`: spawn, stop, crash teardown and restart with backoff
//! - `facade`: the `ProcessBridge` handle callers use

mod actor;
mod correlation;
mod dispatcher;
mod facade;
mod framing;
pub mod protocol;
mod supervisor;

pub use dispatcher::{CallContext, HandlerFuture, HandlerResult, MethodHandler, MethodTable};
pub use facade::{ProcessBridge, RequestOptions};
pub use supervisor::SupervisorState;
