//! Inbound request dispatch.
//!
//! Requests the worker sends to the host are looked up by method name in a
//! `MethodTable` built before the bridge starts. Each request runs in its
//! own task, so a handler that makes nested calls back into the worker never
//! blocks the stdout reader that will deliver their responses.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::time::Instant;

use super::ProcessBridge;
use super::correlation::CorrelationTable;
use super::protocol::{CallId, ErrorObject, MessageId, Request, Response};
use crate::error::HandlerError;
use crate::logging::BridgeLogger;

/// What a handler produces for one request.
pub type HandlerResult = Result<Value, HandlerError>;

/// Boxed future returned by [`MethodHandler::call`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A host capability the worker can invoke by name.
///
/// Implemented for any `Fn(Value, CallContext) -> impl Future` closure, so
/// most handlers are plain async closures:
///
/// ```ignore
/// methods.register("echo", |params, _ctx| async move { Ok(params) });
/// ```
pub trait MethodHandler: Send + Sync {
    fn call(&self, params: Value, context: CallContext) -> HandlerFuture;
}

impl<F, Fut> MethodHandler for F
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, params: Value, context: CallContext) -> HandlerFuture {
        Box::pin(self(params, context))
    }
}

/// Name → handler registry.
#[derive(Clone, Default)]
pub struct MethodTable {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure under `method`, replacing any previous
    /// handler.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(method, Arc::new(handler));
    }

    /// Register a handler object under `method`.
    pub fn register_handler(&mut self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        let method = method.into();
        if self.handlers.insert(method.clone(), handler).is_some() {
            log::debug!(
                target: "tsunagi::bridge",
                "Replaced handler for '{}'",
                method
            );
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(method, handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Per-request context handed to a handler.
#[derive(Clone)]
pub struct CallContext {
    bridge: ProcessBridge,
    request_id: Option<MessageId>,
    call_id: Option<CallId>,
}

impl CallContext {
    pub(crate) fn new(bridge: ProcessBridge, request_id: Option<MessageId>, call_id: Option<CallId>) -> Self {
        Self {
            bridge,
            request_id,
            call_id,
        }
    }

    /// Bridge handle for nested calls back into the worker.
    pub fn bridge(&self) -> &ProcessBridge {
        &self.bridge
    }

    /// Id of the inbound request; `None` for notifications.
    pub fn request_id(&self) -> Option<&MessageId> {
        self.request_id.as_ref()
    }

    /// Outer host call this request was made under, if the worker said so.
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    pub fn logger(&self) -> &dyn BridgeLogger {
        self.bridge.logger()
    }
}

/// Runs inbound requests against the method table.
pub(crate) struct Dispatcher {
    methods: MethodTable,
    table: CorrelationTable,
    verbose: bool,
    logger: Arc<dyn BridgeLogger>,
}

impl Dispatcher {
    pub(crate) fn new(
        methods: MethodTable,
        table: CorrelationTable,
        verbose: bool,
        logger: Arc<dyn BridgeLogger>,
    ) -> Self {
        Self {
            methods,
            table,
            verbose,
            logger,
        }
    }

    /// Handle one inbound request.
    ///
    /// Returns the response to write, or `None` for notifications.
    pub(crate) async fn dispatch(&self, request: Request, bridge: ProcessBridge) -> Option<Response> {
        let Request {
            id,
            method,
            params,
            call_id,
            timeout_ms,
        } = request;

        // Time spent serving this request does not count against the outer
        // call's deadline.
        let budget = match (&call_id, timeout_ms) {
            (Some(call_id), Some(timeout_ms)) => {
                let delta = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
                self.table.bump(call_id, delta).then_some((call_id.clone(), delta))
            }
            _ => None,
        };
        let started = Instant::now();

        let context = CallContext::new(bridge, id.clone(), call_id);
        let outcome = self.run_handler(&method, params, context).await;

        if let Some((call_id, budget_ms)) = budget {
            let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
            self.table.bump(&call_id, elapsed.saturating_sub(budget_ms));
        }

        if let Err(error) = &outcome {
            self.logger.error(&format!(
                "Handler for '{}' failed: {}",
                method,
                error.detail()
            ));
        }

        let id = id?;
        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::failure(id, self.error_object(error)),
        })
    }

    async fn run_handler(&self, method: &str, params: Value, context: CallContext) -> Result<Value, HandlerError> {
        let Some(handler) = self.methods.get(method) else {
            return Err(HandlerError::method_not_found(method));
        };

        match tokio::spawn(handler.call(params, context)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(HandlerError::new(format!(
                "handler for '{}' panicked",
                method
            ))),
            Err(e) => Err(HandlerError::new(format!("handler for '{}' did not finish", method))
                .with_source(e)),
        }
    }

    fn error_object(&self, error: HandlerError) -> ErrorObject {
        let data = error.data().cloned();
        let data = if self.verbose {
            Some(attach_detail(data, error.detail()))
        } else {
            data
        };
        ErrorObject {
            message: error.message().to_string(),
            data,
        }
    }
}

fn attach_detail(data: Option<Value>, detail: String) -> Value {
    match data {
        Some(Value::Object(mut object)) => {
            object.insert("detail".into(), Value::String(detail));
            Value::Object(object)
        }
        None => {
            let mut object = Map::new();
            object.insert("detail".into(), Value::String(detail));
            Value::Object(object)
        }
        Some(other) => {
            let mut object = Map::new();
            object.insert("value".into(), other);
            object.insert("detail".into(), Value::String(detail));
            Value::Object(object)
        }
    }
}
