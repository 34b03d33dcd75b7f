//! Correlation of outward requests with their responses.
//!
//! `CorrelationTable` owns every call the host has sent to the worker and
//! not yet seen settled. Each entry carries its own deadline timer. The table
//! is the only place a call can be completed: response arrival, deadline
//! expiry and bulk cancellation all go through removal from the map, and
//! whoever removes the entry fires its continuation. A call that is no longer
//! in the map cannot fire twice.
//!
//! # Deadline bumping
//!
//! While the worker handles a host request it may call back into the host
//! (a nested call). Time spent serving the nested call should not count
//! against the outer deadline, so the dispatcher calls `bump()` with the
//! outer call's `CallId`. The deadline is always recomputed from
//! `started_at + timeout + adjustment`; the running timer is replaced, never
//! mutated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::{CallId, MessageId, Response};
use crate::error::{BridgeError, BridgeResult, MutexExt};

/// What a waiting caller eventually receives.
pub(crate) type CallOutcome = BridgeResult<Value>;

/// Registry of outward calls awaiting a response.
#[derive(Clone)]
pub(crate) struct CorrelationTable {
    inner: Arc<TableInner>,
}

struct TableInner {
    state: Mutex<TableState>,
    next_id: AtomicI64,
    max_pending: Option<usize>,
}

#[derive(Default)]
struct TableState {
    pending: HashMap<MessageId, PendingCall>,
    by_call_id: HashMap<CallId, MessageId>,
}

struct PendingCall {
    method: String,
    call_id: Option<CallId>,
    timeout: Duration,
    started_at: Instant,
    /// Sum of every bump applied so far, in milliseconds (may be negative)
    adjustment_ms: i64,
    /// Incremented whenever the timer is replaced; stale timers compare unequal
    generation: u64,
    timer: JoinHandle<()>,
    responder: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    /// Milliseconds left before the (adjusted) deadline. Zero or negative
    /// means the deadline has already passed.
    fn remaining_ms(&self, now: Instant) -> i64 {
        let budget = i64::try_from(self.timeout.as_millis()).unwrap_or(i64::MAX);
        let elapsed =
            i64::try_from(now.saturating_duration_since(self.started_at).as_millis())
                .unwrap_or(i64::MAX);
        budget.saturating_add(self.adjustment_ms).saturating_sub(elapsed)
    }

    fn timeout_error(&self) -> BridgeError {
        BridgeError::Timeout {
            method: self.method.clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Cancel the timer and deliver the outcome. Consumes the call.
    fn finish(self, outcome: CallOutcome) {
        self.timer.abort();
        // The caller may have stopped waiting; that is not an error here.
        let _ = self.responder.send(outcome);
    }
}

impl TableState {
    fn remove(&mut self, id: &MessageId) -> Option<PendingCall> {
        let call = self.pending.remove(id)?;
        if let Some(call_id) = &call.call_id {
            self.by_call_id.remove(call_id);
        }
        Some(call)
    }
}

impl TableInner {
    fn lock(&self, context: &str) -> MutexGuard<'_, TableState> {
        self.state.lock_or_recover(context)
    }

    /// Timer callback. Only fires the call if the timer is still current.
    fn expire(&self, id: &MessageId, generation: u64) {
        let call = {
            let mut state = self.lock("CorrelationTable::expire");
            match state.pending.get(id) {
                Some(call) if call.generation == generation => state.remove(id),
                _ => None,
            }
        };

        if let Some(call) = call {
            log::warn!(
                target: "tsunagi::bridge",
                "Request {} '{}' timed out",
                id,
                call.method
            );
            let error = call.timeout_error();
            call.finish(Err(error));
        }
    }
}

/// Stand-in deadline for timeouts too large to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn spawn_timer(
    inner: Weak<TableInner>,
    id: MessageId,
    generation: u64,
    after: Duration,
) -> JoinHandle<()> {
    let now = Instant::now();
    let deadline = now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE);
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(&id, generation);
        }
    })
}

impl CorrelationTable {
    pub(crate) fn new(max_pending: Option<usize>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState::default()),
                next_id: AtomicI64::new(1),
                max_pending,
            }),
        }
    }

    /// Register an outward call and start its deadline timer.
    ///
    /// Must be called before the request is written so the response can be
    /// routed whenever it arrives. Returns the allocated id and the receiver
    /// the caller awaits.
    pub(crate) fn register(
        &self,
        method: &str,
        timeout: Duration,
        call_id: Option<CallId>,
    ) -> BridgeResult<(MessageId, oneshot::Receiver<CallOutcome>)> {
        let mut state = self.inner.lock("CorrelationTable::register");

        if let Some(limit) = self.inner.max_pending {
            if state.pending.len() >= limit {
                return Err(BridgeError::CapacityExceeded { limit });
            }
        }

        let id = MessageId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let timer = spawn_timer(Arc::downgrade(&self.inner), id.clone(), 0, timeout);

        if let Some(call_id) = &call_id {
            state.by_call_id.insert(call_id.clone(), id.clone());
        }
        state.pending.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                call_id,
                timeout,
                started_at: Instant::now(),
                adjustment_ms: 0,
                generation: 0,
                timer,
                responder: tx,
            },
        );

        Ok((id, rx))
    }

    /// Complete a call successfully.
    ///
    /// Returns `false` if no call with this id is pending (already resolved,
    /// timed out or cancelled).
    pub(crate) fn resolve(&self, id: &MessageId, result: Value) -> bool {
        self.complete(id, |_| Ok(result))
    }

    /// Fail a call with the given error.
    pub(crate) fn reject(&self, id: &MessageId, error: BridgeError) -> bool {
        self.complete(id, |_| Err(error))
    }

    /// Route a decoded response to its pending call.
    pub(crate) fn settle(&self, response: Response) -> bool {
        let Response { id, outcome } = response;
        match outcome {
            Ok(result) => self.resolve(&id, result),
            Err(error) => self.complete(&id, |method| {
                Err(BridgeError::Remote {
                    method: method.to_string(),
                    message: error.message,
                    data: error.data,
                })
            }),
        }
    }

    fn complete(&self, id: &MessageId, outcome: impl FnOnce(&str) -> CallOutcome) -> bool {
        let call = self.inner.lock("CorrelationTable::complete").remove(id);
        match call {
            Some(call) => {
                let outcome = outcome(&call.method);
                call.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Shift the deadline of the call registered under `call_id`.
    ///
    /// `delta_ms` may be negative. The remaining time is recomputed from the
    /// call's start; if it is not positive the call fails with a timeout right
    /// away, otherwise its timer is replaced. Returns `false` when no pending
    /// call carries `call_id`.
    pub(crate) fn bump(&self, call_id: &CallId, delta_ms: i64) -> bool {
        let mut state = self.inner.lock("CorrelationTable::bump");

        let Some(id) = state.by_call_id.get(call_id).cloned() else {
            log::debug!(
                target: "tsunagi::bridge",
                "Ignoring timeout bump for unknown call {}",
                call_id
            );
            return false;
        };
        let Some(call) = state.pending.get_mut(&id) else {
            state.by_call_id.remove(call_id);
            return false;
        };

        call.adjustment_ms = call.adjustment_ms.saturating_add(delta_ms);
        let remaining = call.remaining_ms(Instant::now());

        if remaining <= 0 {
            let expired = state.remove(&id);
            drop(state);
            if let Some(call) = expired {
                log::warn!(
                    target: "tsunagi::bridge",
                    "Request {} '{}' ran out of time after bump of {}ms",
                    id,
                    call.method,
                    delta_ms
                );
                let error = call.timeout_error();
                call.finish(Err(error));
            }
            return true;
        }

        call.timer.abort();
        call.generation += 1;
        call.timer = spawn_timer(
            Arc::downgrade(&self.inner),
            id.clone(),
            call.generation,
            Duration::from_millis(remaining.unsigned_abs()),
        );
        log::debug!(
            target: "tsunagi::bridge",
            "Bumped request {} by {}ms, {}ms remaining",
            id,
            delta_ms,
            remaining
        );
        true
    }

    /// Reject every pending call with `reason` and empty the table.
    ///
    /// Safe to call repeatedly; returns how many calls were cancelled.
    pub(crate) fn clear_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingCall> = {
            let mut state = self.inner.lock("CorrelationTable::clear_all");
            state.by_call_id.clear();
            state.pending.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        for call in drained {
            let error = BridgeError::Cancelled {
                method: call.method.clone(),
                reason: reason.to_string(),
            };
            call.finish(Err(error));
        }
        count
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock("CorrelationTable::pending_count").pending.len()
    }

    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.inner
            .lock("CorrelationTable::contains")
            .pending
            .contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ErrorObject;
    use serde_json::json;

    const MS: Duration = Duration::from_millis(1);

    async fn let_timers_run() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_delivers_result_and_removes_entry() {
        let table = CorrelationTable::new(None);
        let (id, rx) = table.register("echo", 50 * MS, None).unwrap();
        assert_eq!(table.pending_count(), 1);

        assert!(table.resolve(&id, json!({"x": 1})));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"x": 1}));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique_while_pending() {
        let table = CorrelationTable::new(None);
        let (a, _rx_a) = table.register("a", 50 * MS, None).unwrap();
        let (b, _rx_b) = table.register("b", 50 * MS, None).unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_responses_reach_their_own_callers() {
        let table = CorrelationTable::new(None);
        let calls: Vec<_> = (0..5)
            .map(|n| {
                let (id, rx) = table.register("echo", 1000 * MS, None).unwrap();
                (n, id, rx)
            })
            .collect();

        for (n, id, _) in calls.iter().rev() {
            assert!(table.resolve(id, json!(n)));
        }
        for (n, _, rx) in calls {
            assert_eq!(rx.await.unwrap().unwrap(), json!(n));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_and_late_response_is_dropped() {
        let table = CorrelationTable::new(None);
        let started = Instant::now();
        let (id, rx) = table.register("echo", 50 * MS, None).unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(started.elapsed() >= 50 * MS);
        assert_eq!(table.pending_count(), 0);

        assert!(!table.resolve(&id, json!(null)), "late response is dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn settle_error_response_becomes_remote_error() {
        let table = CorrelationTable::new(None);
        let (id, rx) = table.register("fs/readFile", 50 * MS, None).unwrap();

        let mut error = ErrorObject::new("file not found");
        error.data = Some(json!({"path": "/nope"}));
        assert!(table.settle(Response::failure(id, error)));

        match rx.await.unwrap() {
            Err(BridgeError::Remote {
                method,
                message,
                data,
            }) => {
                assert_eq!(method, "fs/readFile");
                assert_eq!(message, "file not found");
                assert_eq!(data, Some(json!({"path": "/nope"})));
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bump_extends_deadline_past_original() {
        let table = CorrelationTable::new(None);
        let call_id = CallId::generate();
        let (id, rx) = table
            .register("slow", 50 * MS, Some(call_id.clone()))
            .unwrap();

        tokio::time::advance(40 * MS).await;
        assert!(table.bump(&call_id, 100));

        // Past the unextended deadline (50ms) but inside the extended one (150ms)
        tokio::time::advance(30 * MS).await;
        let_timers_run().await;
        assert!(table.contains(&id), "extended call must still be pending");

        assert!(table.resolve(&id, json!("done")));
        assert_eq!(rx.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn extended_call_still_times_out_at_new_deadline() {
        let table = CorrelationTable::new(None);
        let call_id = CallId::generate();
        let started = Instant::now();
        let (_id, rx) = table.register("slow", 50 * MS, Some(call_id.clone())).unwrap();

        assert!(table.bump(&call_id, 100));
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= 150 * MS);
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_past_elapsed_time_fails_immediately() {
        let table = CorrelationTable::new(None);
        let call_id = CallId::generate();
        let (id, rx) = table.register("slow", 50 * MS, Some(call_id.clone())).unwrap();

        tokio::time::advance(20 * MS).await;
        assert!(table.bump(&call_id, -40));

        assert!(!table.contains(&id));
        assert!(rx.await.unwrap().unwrap_err().is_timeout());
        assert!(!table.bump(&call_id, 10), "call id is forgotten once settled");
    }

    #[tokio::test(start_paused = true)]
    async fn nested_round_trip_charges_only_elapsed_time() {
        let table = CorrelationTable::new(None);
        let call_id = CallId::generate();
        let (id, rx) = table.register("outer", 100 * MS, Some(call_id.clone())).unwrap();

        // Nested call with a 1000ms budget that takes 80ms
        tokio::time::advance(10 * MS).await;
        assert!(table.bump(&call_id, 1000));
        tokio::time::advance(80 * MS).await;
        assert!(table.bump(&call_id, -(1000 - 80)));

        // Deadline is now 100 + 80 = 180ms after start; we are at 90ms
        tokio::time::advance(80 * MS).await;
        let_timers_run().await;
        assert!(table.contains(&id));

        tokio::time::advance(15 * MS).await;
        let_timers_run().await;
        assert!(!table.contains(&id));
        assert!(rx.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn bump_for_unknown_call_id_is_a_no_op() {
        let table = CorrelationTable::new(None);
        let (_id, _rx) = table.register("echo", 50 * MS, None).unwrap();
        assert!(!table.bump(&CallId::from("missing"), 100));
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_rejects_everything_with_same_reason() {
        let table = CorrelationTable::new(None);
        let receivers: Vec<_> = (0..3)
            .map(|_| table.register("echo", 1000 * MS, None).unwrap().1)
            .collect();

        assert_eq!(table.clear_all("worker stopped"), 3);
        assert_eq!(table.pending_count(), 0);
        assert_eq!(table.clear_all("worker stopped"), 0, "idempotent");

        for rx in receivers {
            match rx.await.unwrap() {
                Err(BridgeError::Cancelled { reason, .. }) => {
                    assert_eq!(reason, "worker stopped")
                }
                other => panic!("expected cancellation, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_calls_do_not_time_out_later() {
        let table = CorrelationTable::new(None);
        let (_id, rx) = table.register("echo", 10 * MS, None).unwrap();
        table.clear_all("worker crashed");

        tokio::time::advance(50 * MS).await;
        let_timers_run().await;
        assert!(rx.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_waits_for_the_response() {
        let table = CorrelationTable::new(None);
        let (id, rx) = table.register("echo", Duration::MAX, None).unwrap();

        tokio::time::advance(Duration::from_secs(3_600)).await;
        let_timers_run().await;
        assert!(table.contains(&id));

        assert!(table.resolve(&id, json!("done")));
        assert_eq!(rx.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_limit_rejects_extra_calls() {
        let table = CorrelationTable::new(Some(2));
        let _a = table.register("a", 50 * MS, None).unwrap();
        let _b = table.register("b", 50 * MS, None).unwrap();

        let err = table.register("c", 50 * MS, None).unwrap_err();
        assert!(matches!(err, BridgeError::CapacityExceeded { limit: 2 }));
        assert_eq!(table.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_delivers_error_once() {
        let table = CorrelationTable::new(None);
        let (id, rx) = table.register("echo", 50 * MS, None).unwrap();

        assert!(table.reject(&id, BridgeError::transport("broken pipe")));
        assert!(!table.reject(&id, BridgeError::transport("again")));
        assert!(matches!(
            rx.await.unwrap(),
            Err(BridgeError::Transport { .. })
        ));
    }
}
