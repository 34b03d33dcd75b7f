//! Built-in host capabilities a worker can call.
//!
//! | Method               | Params                 | Result        |
//! |----------------------|------------------------|---------------|
//! | `echo`               | anything               | the params    |
//! | `window/showMessage` | `{ type?, message }`   | `null`        |
//! | `fs/readFile`        | `{ path }`             | `{ content }` |
//! | `fs/writeFile`       | `{ path, content }`    | `null`        |

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::bridge::{CallContext, HandlerResult, MethodTable};
use crate::error::HandlerError;

/// Message severity, numbered as in LSP's `MessageType`.
const MESSAGE_TYPE_ERROR: u8 = 1;

#[derive(Debug, Deserialize)]
struct ShowMessageParams {
    #[serde(rename = "type", default)]
    kind: Option<u8>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReadFileParams {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WriteFileParams {
    path: PathBuf,
    content: String,
}

/// Method table with every built-in capability registered.
pub fn builtin_methods() -> MethodTable {
    let mut methods = MethodTable::new();
    register_builtins(&mut methods);
    methods
}

/// Add the built-in capabilities to an existing table.
pub fn register_builtins(methods: &mut MethodTable) {
    methods.register("echo", |params, _ctx| async move { Ok(params) });
    methods.register("window/showMessage", show_message);
    methods.register("fs/readFile", read_file);
    methods.register("fs/writeFile", write_file);
}

async fn show_message(params: Value, context: CallContext) -> HandlerResult {
    let params: ShowMessageParams = serde_json::from_value(params)?;
    if params.kind == Some(MESSAGE_TYPE_ERROR) {
        context.logger().error(&params.message);
    } else {
        context.logger().info(&params.message);
    }
    Ok(Value::Null)
}

async fn read_file(params: Value, _context: CallContext) -> HandlerResult {
    let params: ReadFileParams = serde_json::from_value(params)?;
    let content = tokio::fs::read_to_string(&params.path)
        .await
        .map_err(|e| file_error("read", &params.path, e))?;
    Ok(json!({ "content": content }))
}

async fn write_file(params: Value, _context: CallContext) -> HandlerResult {
    let params: WriteFileParams = serde_json::from_value(params)?;
    tokio::fs::write(&params.path, params.content.as_bytes())
        .await
        .map_err(|e| file_error("write", &params.path, e))?;
    Ok(Value::Null)
}

fn file_error(action: &str, path: &std::path::Path, err: std::io::Error) -> HandlerError {
    HandlerError::new(format!("failed to {} {}: {}", action, path.display(), err))
        .with_data(json!({ "path": path.display().to_string() }))
        .with_source(err)
}
