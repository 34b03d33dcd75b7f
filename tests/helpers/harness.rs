//! Bridge harness driving the real `tsunagi-echo-worker` binary.

// Shared across several test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tsunagi::{
    BridgeError, BridgeLogger, BridgeSettings, MethodTable, OutputStream, ProcessBridge,
    RequestOptions, WorkerCommand,
};

/// Logger that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingLogger {
    infos: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    output: Mutex<Vec<(OutputStream, String)>>,
}

impl RecordingLogger {
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn output(&self) -> Vec<(OutputStream, String)> {
        self.output.lock().unwrap().clone()
    }

    pub fn has_output(&self, stream: OutputStream, line: &str) -> bool {
        self.output()
            .iter()
            .any(|(s, l)| *s == stream && l == line)
    }
}

impl BridgeLogger for RecordingLogger {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn worker_output(&self, stream: OutputStream, line: &str) {
        self.output.lock().unwrap().push((stream, line.to_string()));
    }
}

/// `CARGO_BIN_EXE_*` is set by Cargo's test harness for integration tests.
pub fn echo_worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_tsunagi-echo-worker"))
}

/// Settings with short delays so lifecycle tests run quickly.
pub fn fast_settings() -> BridgeSettings {
    BridgeSettings {
        default_timeout_ms: 5_000,
        restart_delay_ms: 100,
        max_restart_delay_ms: 1_000,
        kill_grace_ms: 500,
        settle_delay_ms: 50,
        ..BridgeSettings::default()
    }
}

pub fn new_bridge(settings: BridgeSettings, methods: MethodTable) -> (ProcessBridge, Arc<RecordingLogger>) {
    let logger = Arc::new(RecordingLogger::default());
    let bridge = ProcessBridge::new(settings, methods, logger.clone());
    (bridge, logger)
}

/// Bridge with the echo worker already running.
pub async fn started_bridge(
    settings: BridgeSettings,
    methods: MethodTable,
) -> (ProcessBridge, Arc<RecordingLogger>) {
    let (bridge, logger) = new_bridge(settings, methods);
    bridge
        .start(echo_worker())
        .await
        .expect("echo worker should start");
    assert!(bridge.is_running());
    (bridge, logger)
}

pub fn within(ms: u64) -> RequestOptions {
    RequestOptions::with_timeout(Duration::from_millis(ms))
}

/// Fire a request in the background.
pub fn spawn_request(
    bridge: &ProcessBridge,
    method: &'static str,
    params: Value,
    options: RequestOptions,
) -> tokio::task::JoinHandle<Result<Value, BridgeError>> {
    let bridge = bridge.clone();
    tokio::spawn(async move { bridge.send_request(method, params, options).await })
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
