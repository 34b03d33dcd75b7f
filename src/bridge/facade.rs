//! Caller-facing bridge handle.
//!
//! `ProcessBridge` is cheap to clone; every clone drives the same worker,
//! correlation table and method table. Dropping the last clone tears the
//! worker down.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::actor::OutboundMessage;
use super::correlation::CorrelationTable;
use super::dispatcher::{Dispatcher, MethodTable};
use super::protocol::{CallId, Decoded, Message, Request, decode_line, encode};
use super::supervisor::{StartTrigger, Supervisor, SupervisorState};
use crate::config::{BridgeSettings, WorkerCommand};
use crate::error::{BridgeError, BridgeResult};
use crate::logging::{BridgeLogger, OutputStream};

/// Per-request options for [`ProcessBridge::send_request`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Deadline for the response; the configured default when `None`
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Bidirectional RPC bridge to one supervised worker process.
#[derive(Clone)]
pub struct ProcessBridge {
    shared: Arc<Shared>,
}

/// State shared by every clone of a bridge and by its background tasks.
pub(crate) struct Shared {
    pub(crate) settings: BridgeSettings,
    pub(crate) logger: Arc<dyn BridgeLogger>,
    pub(crate) table: CorrelationTable,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) supervisor: Supervisor,
}

impl ProcessBridge {
    /// Build a bridge. No process is spawned until [`start`](Self::start).
    pub fn new(settings: BridgeSettings, methods: MethodTable, logger: Arc<dyn BridgeLogger>) -> Self {
        let table = CorrelationTable::new(settings.max_pending_calls);
        let dispatcher = Dispatcher::new(methods, table.clone(), settings.verbose, Arc::clone(&logger));
        let supervisor = Supervisor::new(settings.auto_restart);
        Self {
            shared: Arc::new(Shared {
                settings,
                logger,
                table,
                dispatcher,
                supervisor,
            }),
        }
    }

    /// Start the worker, replacing any running one.
    ///
    /// Returns once the preparation step (first start only) and the settle
    /// delay have passed. A [`stop`](Self::stop) that arrives meanwhile
    /// cancels the start with [`BridgeError::StartCancelled`].
    pub async fn start(&self, command: WorkerCommand) -> BridgeResult<()> {
        self.shared
            .start_worker(Some(command), StartTrigger::Caller)
            .await
    }

    /// Start the worker named in the settings (or the last one started).
    pub async fn start_configured(&self) -> BridgeResult<()> {
        self.shared.start_worker(None, StartTrigger::Caller).await
    }

    /// Stop the worker. Pending calls fail with "worker stopped", no
    /// restart is scheduled, and a start still in progress backs out before
    /// this returns.
    pub async fn stop(&self) {
        self.shared.stop_worker().await;
    }

    /// Stop and start the last worker command again.
    pub async fn restart(&self) -> BridgeResult<()> {
        self.shared.start_worker(None, StartTrigger::Caller).await
    }

    pub fn is_running(&self) -> bool {
        self.shared.supervisor.is_running()
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.supervisor.state()
    }

    /// Process id of the live worker.
    pub fn worker_pid(&self) -> Option<u32> {
        self.shared.supervisor.pid()
    }

    /// Number of outward calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.table.pending_count()
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.shared.settings
    }

    pub fn logger(&self) -> &dyn BridgeLogger {
        self.shared.logger.as_ref()
    }

    /// Call `method` on the worker and wait for its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        options: RequestOptions,
    ) -> BridgeResult<Value> {
        let shared = &self.shared;
        let Some(outbound) = shared.supervisor.outbound() else {
            return Err(BridgeError::NotRunning);
        };

        let timeout = options
            .timeout
            .unwrap_or_else(|| shared.settings.default_timeout());
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let call_id = CallId::generate();
        let (id, rx) = shared.table.register(method, timeout, Some(call_id.clone()))?;

        let request = Request::new(id.clone(), method, params).with_budget(call_id, timeout_ms);
        let line = match encode(&Message::Request(request)) {
            Ok(line) => line,
            Err(e) => {
                shared.table.reject(&id, BridgeError::transport("request could not be encoded"));
                return Err(BridgeError::Encode(e));
            }
        };

        log::debug!(
            target: "tsunagi::bridge",
            "Sending request {} '{}' (timeout {}ms)",
            id,
            method,
            timeout_ms
        );
        if outbound
            .send(OutboundMessage::Request {
                line,
                id: id.clone(),
            })
            .await
            .is_err()
        {
            shared
                .table
                .reject(&id, BridgeError::transport("worker input is closed"));
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::Cancelled {
                method: method.to_string(),
                reason: "bridge dropped".to_string(),
            }),
        }
    }

    /// Send a notification. Best effort: nothing happens when no worker is
    /// running, and the message is dropped if the outbound queue is full.
    pub fn send_notification(&self, method: &str, params: Value) {
        let Some(outbound) = self.shared.supervisor.outbound() else {
            log::debug!(
                target: "tsunagi::bridge",
                "Dropping notification '{}': worker not running",
                method
            );
            return;
        };

        let line = match encode(&Message::Request(Request::notification(method, params))) {
            Ok(line) => line,
            Err(e) => {
                self.shared
                    .logger
                    .error(&format!("Failed to encode notification '{}': {}", method, e));
                return;
            }
        };

        match outbound.try_send(OutboundMessage::Notification(line)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    target: "tsunagi::bridge",
                    "Outbound queue full, dropping notification '{}'",
                    method
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Wait until every message queued so far has reached the worker's
    /// stdin (or failed to).
    pub async fn flush(&self) -> BridgeResult<()> {
        let Some(outbound) = self.shared.supervisor.outbound() else {
            return Err(BridgeError::NotRunning);
        };
        let (ack, written) = oneshot::channel();
        outbound
            .send(OutboundMessage::Flush(ack))
            .await
            .map_err(|_| BridgeError::transport("worker input is closed"))?;
        written
            .await
            .map_err(|_| BridgeError::transport("worker went away before the queue was written"))
    }
}

impl Shared {
    /// Route one line of worker stdout.
    ///
    /// `responses` is the stdin queue of the worker that produced the line,
    /// so answers to its requests never reach a replacement worker.
    pub(crate) fn handle_line(self: &Arc<Self>, line: &str, responses: &mpsc::Sender<OutboundMessage>) {
        match decode_line(line) {
            Decoded::Diagnostic(text) => self.logger.worker_output(OutputStream::Stdout, &text),
            Decoded::Malformed { line, reason } => {
                self.logger
                    .error(&format!("Malformed message from worker ({}): {}", reason, line));
            }
            Decoded::Message(Message::Response(response)) => {
                let id = response.id.clone();
                if !self.table.settle(response) {
                    self.logger
                        .info(&format!("No pending handler for id {}", id));
                }
            }
            Decoded::Message(Message::Request(request)) => {
                let shared = Arc::clone(self);
                let responses = responses.clone();
                tokio::spawn(async move {
                    let bridge = ProcessBridge {
                        shared: Arc::clone(&shared),
                    };
                    let Some(response) = shared.dispatcher.dispatch(request, bridge).await else {
                        return;
                    };
                    let line = match encode(&Message::Response(response)) {
                        Ok(line) => line,
                        Err(e) => {
                            shared
                                .logger
                                .error(&format!("Failed to encode response: {}", e));
                            return;
                        }
                    };
                    if responses.send(OutboundMessage::Response(line)).await.is_err() {
                        log::debug!(
                            target: "tsunagi::bridge",
                            "Worker went away before its response was written"
                        );
                    }
                });
            }
        }
    }
}
