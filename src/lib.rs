//! tsunagi: a bidirectional JSON-RPC bridge between a host and a supervised
//! worker process speaking newline-delimited JSON over stdio.
//!
//! ```ignore
//! let bridge = ProcessBridge::new(settings, builtin_methods(), Arc::new(LogForwarder));
//! bridge.start(WorkerCommand::new("python3").args(["worker.py"])).await?;
//! let result = bridge.send_request("echo", json!({"hi": 1}), RequestOptions::default()).await?;
//! bridge.stop().await;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod methods;

pub use bridge::protocol::{CallId, ErrorObject, Message, MessageId, Request, Response};
pub use bridge::{
    CallContext, HandlerFuture, HandlerResult, MethodHandler, MethodTable, ProcessBridge,
    RequestOptions, SupervisorState,
};
pub use config::{BridgeSettings, PrepareStep, WorkerCommand};
pub use error::{BridgeError, BridgeResult, HandlerError};
pub use logging::{BridgeLogger, LogForwarder, OutputStream};
pub use methods::builtin_methods;
