//! Reference worker for the tsunagi bridge.
//!
//! Reads newline-delimited JSON requests on stdin and answers on stdout.
//! Besides `echo` it offers methods that misbehave on purpose (sleeping,
//! never answering, crashing, printing non-protocol text) and `nested`,
//! which calls back into the host under the caller's `callId`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

type HostReply = Result<Value, Value>;

#[derive(Default)]
struct Worker {
    /// Requests this worker sent to the host, by id
    pending: Mutex<HashMap<String, oneshot::Sender<HostReply>>>,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct CrashParams {
    #[serde(default = "default_crash_code")]
    code: i32,
}

fn default_crash_code() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
struct TextParams {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedParams {
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let worker = Arc::new(Worker::default());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("echo-worker ready");

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_line(&worker, &out_tx, &line),
            Ok(None) => break,
            Err(e) => {
                eprintln!("echo-worker: stdin error: {}", e);
                break;
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

fn handle_line(worker: &Arc<Worker>, out: &mpsc::Sender<String>, line: &str) {
    let message: Map<String, Value> = match serde_json::from_str(line) {
        Ok(Value::Object(message)) => message,
        _ => {
            eprintln!("echo-worker: ignoring unparsable line: {}", line);
            return;
        }
    };

    let Some(method) = message.get("method").and_then(Value::as_str).map(str::to_string) else {
        route_host_reply(worker, message);
        return;
    };

    let id = message.get("id").cloned();
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    let call_id = message.get("callId").cloned();
    let worker = Arc::clone(worker);
    let out = out.clone();

    tokio::spawn(async move {
        let outcome = run_method(&worker, &out, &method, params, call_id).await;
        let Some(id) = id else {
            return;
        };
        let Some(outcome) = outcome else {
            return;
        };
        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(message) => json!({"jsonrpc": "2.0", "id": id, "error": {"message": message}}),
        };
        let _ = out.send(format!("{}\n", response)).await;
    });
}

fn route_host_reply(worker: &Worker, mut message: Map<String, Value>) {
    let id = match message.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => return,
    };
    let Some(reply_tx) = worker.pending.lock().ok().and_then(|mut pending| pending.remove(&id)) else {
        eprintln!("echo-worker: reply for unknown id {}", id);
        return;
    };
    let reply = match message.remove("error") {
        Some(error) if !error.is_null() => Err(error),
        _ => Ok(message.remove("result").unwrap_or(Value::Null)),
    };
    let _ = reply_tx.send(reply);
}

/// Returns `None` when the method deliberately never answers.
async fn run_method(
    worker: &Worker,
    out: &mpsc::Sender<String>,
    method: &str,
    params: Value,
    call_id: Option<Value>,
) -> Option<Result<Value, String>> {
    let outcome = match method {
        "echo" => Ok(params),
        "sleep" => match serde_json::from_value::<SleepParams>(params) {
            Ok(p) => {
                tokio::time::sleep(Duration::from_millis(p.ms)).await;
                Ok(p.result)
            }
            Err(e) => Err(format!("invalid params: {}", e)),
        },
        "silent" => return None,
        "crash" => {
            let code = serde_json::from_value::<CrashParams>(params)
                .map(|p| p.code)
                .unwrap_or_else(|_| default_crash_code());
            eprintln!("echo-worker: crashing with code {}", code);
            std::process::exit(code);
        }
        "exit" => std::process::exit(0),
        "print" => match serde_json::from_value::<TextParams>(params) {
            Ok(p) => {
                let _ = out.send(format!("{}\n", p.text)).await;
                Ok(json!({"printed": true}))
            }
            Err(e) => Err(format!("invalid params: {}", e)),
        },
        "stderr" => match serde_json::from_value::<TextParams>(params) {
            Ok(p) => {
                eprintln!("{}", p.text);
                Ok(Value::Null)
            }
            Err(e) => Err(format!("invalid params: {}", e)),
        },
        "nested" => match serde_json::from_value::<NestedParams>(params) {
            Ok(p) => call_host(worker, out, p, call_id)
                .await
                .map(|result| json!({"nested": result})),
            Err(e) => Err(format!("invalid params: {}", e)),
        },
        other => Err(format!("method not found: {}", other)),
    };
    Some(outcome)
}

async fn call_host(
    worker: &Worker,
    out: &mpsc::Sender<String>,
    nested: NestedParams,
    call_id: Option<Value>,
) -> Result<Value, String> {
    let id = format!("w-{}", worker.next_id.fetch_add(1, Ordering::Relaxed) + 1);
    let (tx, rx) = oneshot::channel();
    worker
        .pending
        .lock()
        .map_err(|_| "pending map poisoned".to_string())?
        .insert(id.clone(), tx);

    let mut request = Map::new();
    request.insert("jsonrpc".into(), json!("2.0"));
    request.insert("id".into(), json!(id));
    request.insert("method".into(), json!(nested.method));
    request.insert("params".into(), nested.params);
    if let Some(call_id) = call_id {
        request.insert("callId".into(), call_id);
    }
    if let Some(timeout_ms) = nested.timeout_ms {
        request.insert("timeoutMs".into(), json!(timeout_ms));
    }
    out.send(format!("{}\n", Value::Object(request)))
        .await
        .map_err(|_| "stdout closed".to_string())?;

    match rx.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(error)) => Err(error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string)),
        Err(_) => Err("host reply channel dropped".to_string()),
    }
}
