//! Worker process lifecycle.
//!
//! The supervisor owns at most one live worker. Start, stop, crash and
//! restart all funnel into the same teardown routine, so the worker handle
//! is never released without its pending calls being cancelled, and pending
//! calls are cancelled exactly once per worker.
//!
//! A stop bumps the stop epoch. A start remembers the epoch it began under
//! and backs out, killing anything it already spawned, once the epoch moves.
//!
//! Lock order: the worker slot before `state`. Neither lock is held across
//! an `.await`.

mod process;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::actor::{
    OUTBOUND_QUEUE_CAPACITY, OutboundMessage, ReaderTaskHandle, WriterTaskHandle,
    spawn_reader_task, spawn_writer_task,
};
use super::facade::Shared;
use crate::config::WorkerCommand;
use crate::error::{BridgeError, BridgeResult, MutexExt};
use crate::logging::OutputStream;

use process::WorkerExit;

/// Lifecycle state of the supervised worker.
///
/// ```text
/// Stopped → Starting → Running → Stopped | Crashed
/// Crashed → Starting (after backoff, when auto-restart is on)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No worker; nothing scheduled
    Stopped,
    /// Preparation, spawn or settle delay in progress
    Starting,
    /// Worker is live and accepting requests
    Running,
    /// Worker exited uncleanly or failed to start
    Crashed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Who asked for a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartTrigger {
    Caller,
    Restart,
}

/// Resources tied to one live worker process.
///
/// Dropping the handle cancels the reader and writer tasks; the process
/// itself is owned by its watcher task.
struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    spawned_at: Instant,
    outbound: mpsc::Sender<OutboundMessage>,
    /// Asks the watcher to terminate the process. Taken by the first stop.
    stop_tx: Option<oneshot::Sender<()>>,
    /// Becomes `true` once the watcher has run teardown
    exited: watch::Receiver<bool>,
    _stdout: ReaderTaskHandle,
    _stderr: ReaderTaskHandle,
    _writer: WriterTaskHandle,
}

pub(crate) struct Supervisor {
    state: watch::Sender<SupervisorState>,
    worker: Mutex<Option<WorkerHandle>>,
    restart_timer: Mutex<Option<JoinHandle<()>>>,
    /// Last command passed to `start`, reused by restarts
    command: Mutex<Option<WorkerCommand>>,
    /// Auto-restart as configured; restored by every caller start
    configured_auto_restart: bool,
    auto_restart: AtomicBool,
    /// The preparation step has succeeded once
    prepared: AtomicBool,
    restart_attempts: AtomicU32,
    next_generation: AtomicU64,
    stop_epoch: AtomicU64,
}

impl Supervisor {
    pub(crate) fn new(auto_restart: bool) -> Self {
        Self {
            state: watch::Sender::new(SupervisorState::Stopped),
            worker: Mutex::new(None),
            restart_timer: Mutex::new(None),
            command: Mutex::new(None),
            configured_auto_restart: auto_restart,
            auto_restart: AtomicBool::new(auto_restart),
            prepared: AtomicBool::new(false),
            restart_attempts: AtomicU32::new(0),
            next_generation: AtomicU64::new(1),
            stop_epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    fn set_state(&self, new_state: SupervisorState) {
        self.state.send_replace(new_state);
    }

    /// Set `new_state` unless a start is in progress.
    fn settle_state(&self, new_state: SupervisorState) {
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Starting {
                return false;
            }
            *state = new_state;
            true
        });
    }

    /// Settle on `Stopped` unless a worker is live or a start is underway.
    fn settle_stopped(&self) {
        let worker = self.worker.lock_or_recover("Supervisor::settle_stopped");
        if worker.is_none() {
            self.settle_state(SupervisorState::Stopped);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        let worker = self.worker.lock_or_recover("Supervisor::is_running");
        worker.is_some() && self.state() == SupervisorState::Running
    }

    /// Sender into the live worker's stdin queue.
    pub(crate) fn outbound(&self) -> Option<mpsc::Sender<OutboundMessage>> {
        self.worker
            .lock_or_recover("Supervisor::outbound")
            .as_ref()
            .map(|handle| handle.outbound.clone())
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.worker
            .lock_or_recover("Supervisor::pid")
            .as_ref()
            .and_then(|handle| handle.pid)
    }

    fn cancel_restart_timer(&self) {
        if let Some(timer) = self
            .restart_timer
            .lock_or_recover("Supervisor::cancel_restart_timer")
            .take()
        {
            timer.abort();
        }
    }

    /// Claim the `Starting` state and return the stop epoch the start runs
    /// under.
    ///
    /// Fails while another start is in progress, and for automatic restarts
    /// once a stop has disabled them.
    fn begin_start(&self, trigger: StartTrigger) -> Result<u64, &'static str> {
        let mut claim = Err("a start is already in progress");
        self.state.send_if_modified(|state| {
            if *state == SupervisorState::Starting {
                return false;
            }
            match trigger {
                StartTrigger::Caller => self
                    .auto_restart
                    .store(self.configured_auto_restart, Ordering::SeqCst),
                StartTrigger::Restart if !self.auto_restart.load(Ordering::SeqCst) => {
                    claim = Err("the worker was stopped");
                    return false;
                }
                StartTrigger::Restart => {}
            }
            *state = SupervisorState::Starting;
            claim = Ok(self.stop_epoch.load(Ordering::SeqCst));
            true
        });
        claim
    }

    /// Disable automatic restarts and invalidate any start in progress.
    ///
    /// Runs under the state lock so it cannot interleave with `begin_start`.
    fn request_stop(&self) {
        self.state.send_if_modified(|_| {
            self.auto_restart.store(false, Ordering::SeqCst);
            self.stop_epoch.fetch_add(1, Ordering::SeqCst);
            false
        });
    }

    fn stopped_since(&self, epoch: u64) -> bool {
        self.stop_epoch.load(Ordering::SeqCst) != epoch
    }

    /// Wait until no start is in progress.
    async fn wait_for_start(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state != SupervisorState::Starting)
            .await;
    }
}

type StartFuture = Pin<Box<dyn Future<Output = BridgeResult<()>> + Send>>;

impl Shared {
    /// Start (or replace) the worker.
    ///
    /// `command` overrides and replaces the remembered command; `None`
    /// reuses it, falling back to the configured one.
    pub(crate) async fn start_worker(
        self: &Arc<Self>,
        command: Option<WorkerCommand>,
        trigger: StartTrigger,
    ) -> BridgeResult<()> {
        let supervisor = &self.supervisor;
        let epoch = match supervisor.begin_start(trigger) {
            Ok(epoch) => epoch,
            Err(reason) => {
                self.logger
                    .info(&format!("Ignoring start request: {}", reason));
                return Ok(());
            }
        };

        if trigger == StartTrigger::Caller {
            supervisor.restart_attempts.store(0, Ordering::SeqCst);
        }
        supervisor.cancel_restart_timer();
        self.terminate_worker().await;
        if supervisor.stopped_since(epoch) {
            return self.abandon_start();
        }

        let command = {
            let mut remembered = supervisor.command.lock_or_recover("Shared::start_worker");
            if let Some(command) = command {
                *remembered = Some(command);
            }
            remembered.clone().or_else(|| self.settings.worker.clone())
        };
        let Some(command) = command else {
            return self.fail_start(BridgeError::MissingCommand, trigger);
        };

        if let Some(step) = &command.prepare {
            if !supervisor.prepared.load(Ordering::SeqCst) {
                if let Err(e) = process::run_prepare(step, command.working_dir.as_deref()).await {
                    if supervisor.stopped_since(epoch) {
                        return self.abandon_start();
                    }
                    return self.fail_start(e, trigger);
                }
                supervisor.prepared.store(true, Ordering::SeqCst);
            }
            if supervisor.stopped_since(epoch) {
                return self.abandon_start();
            }
        }

        let spawned = match process::spawn_worker(&command) {
            Ok(spawned) => spawned,
            Err(e) => return self.fail_start(e, trigger),
        };
        let process::SpawnedWorker {
            mut child,
            stdin,
            stdout,
            stderr,
        } = spawned;

        let generation = supervisor.next_generation.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let stdout_reader = {
            let weak = Arc::downgrade(self);
            let responses = outbound.clone();
            spawn_reader_task("stdout", stdout, move |line| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_line(&line, &responses);
                }
            })
        };
        let stderr_reader = {
            let logger = Arc::clone(&self.logger);
            spawn_reader_task("stderr", stderr, move |line| {
                logger.worker_output(OutputStream::Stderr, &line);
            })
        };
        let writer = spawn_writer_task(stdin, rx, self.table.clone());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = WorkerHandle {
            generation,
            pid,
            spawned_at: Instant::now(),
            outbound,
            stop_tx: Some(stop_tx),
            exited: exited_rx,
            _stdout: stdout_reader,
            _stderr: stderr_reader,
            _writer: writer,
        };

        {
            let mut slot = supervisor.worker.lock_or_recover("Shared::start_worker");
            // Checked under the slot lock: a stop that bumped the epoch
            // before this point finds no worker to terminate.
            if supervisor.stopped_since(epoch) {
                drop(slot);
                drop(handle);
                // kill_on_drop takes the process down
                drop(child);
                return self.abandon_start();
            }
            *slot = Some(handle);
            supervisor.set_state(SupervisorState::Running);
        }

        let weak = Arc::downgrade(self);
        let grace = self.settings.kill_grace();
        tokio::spawn(async move {
            // A dropped sender means the handle went away; stop as well
            let exit = tokio::select! {
                status = child.wait() => WorkerExit::from_wait(status, false),
                _ = stop_rx => {
                    let status = process::terminate(&mut child, grace).await;
                    WorkerExit::from_wait(status, true)
                }
            };
            if let Some(shared) = weak.upgrade() {
                shared.handle_worker_exit(generation, exit);
            }
            exited_tx.send_replace(true);
        });

        self.logger.info(&format!(
            "Worker started: {} (pid {})",
            command.display(),
            pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
        ));

        tokio::time::sleep(self.settings.settle_delay()).await;
        Ok(())
    }

    fn fail_start(self: &Arc<Self>, error: BridgeError, trigger: StartTrigger) -> BridgeResult<()> {
        self.logger
            .error(&format!("Failed to start worker: {}", error));

        let retry = self.supervisor.auto_restart.load(Ordering::SeqCst)
            && match error {
                BridgeError::MissingCommand => false,
                BridgeError::Prepare { .. } => true,
                _ => trigger == StartTrigger::Restart,
            };
        self.supervisor.set_state(if retry {
            SupervisorState::Crashed
        } else {
            SupervisorState::Stopped
        });
        if retry {
            self.schedule_restart();
        }
        Err(error)
    }

    /// Give up a start that a stop overtook. Releases the `Starting` claim.
    fn abandon_start(&self) -> BridgeResult<()> {
        self.logger.info("Worker start cancelled by stop");
        self.supervisor.set_state(SupervisorState::Stopped);
        Err(BridgeError::StartCancelled)
    }

    /// Stop the worker and disable automatic restarts.
    ///
    /// A start already underway backs out before this returns.
    pub(crate) async fn stop_worker(&self) {
        let supervisor = &self.supervisor;
        supervisor.request_stop();
        supervisor.cancel_restart_timer();
        if !self.terminate_worker().await {
            log::debug!(
                target: "tsunagi::bridge::supervisor",
                "Stop requested with no live worker"
            );
        }
        supervisor.wait_for_start().await;
        supervisor.settle_stopped();
    }

    /// Ask the watcher to terminate the live worker and wait for teardown.
    ///
    /// Concurrent callers all wait for the same teardown; only the first one
    /// sends the request. Returns `false` when there was no worker to stop.
    async fn terminate_worker(&self) -> bool {
        let (stop_tx, mut exited) = {
            let mut slot = self
                .supervisor
                .worker
                .lock_or_recover("Shared::terminate_worker");
            let Some(handle) = slot.as_mut() else {
                return false;
            };
            (handle.stop_tx.take(), handle.exited.clone())
        };

        if let Some(stop_tx) = stop_tx {
            // Err: the watcher already saw the process exit
            let _ = stop_tx.send(());
        }
        let _ = exited.wait_for(|done| *done).await;
        true
    }

    /// Common teardown for every way a worker can end.
    fn handle_worker_exit(self: &Arc<Self>, generation: u64, exit: WorkerExit) {
        let supervisor = &self.supervisor;
        let handle = {
            let mut slot = supervisor.worker.lock_or_recover("Shared::handle_worker_exit");
            match slot.as_ref() {
                Some(handle) if handle.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            log::debug!(
                target: "tsunagi::bridge::supervisor",
                "Ignoring exit of stale worker generation {}",
                generation
            );
            return;
        };

        supervisor.cancel_restart_timer();
        let reason = exit.reason();
        let clean = exit.is_clean();
        let restart = !clean && supervisor.auto_restart.load(Ordering::SeqCst);
        supervisor.settle_state(if clean {
            SupervisorState::Stopped
        } else {
            SupervisorState::Crashed
        });

        if clean {
            self.logger.info(&format!("Worker exited: {}", reason));
        } else {
            self.logger.error(&format!("Worker crashed: {}", reason));
        }

        let uptime = handle.spawned_at.elapsed();
        drop(handle);

        let cancelled = self.table.clear_all(&reason);
        if cancelled > 0 {
            self.logger.info(&format!(
                "Rejected {} pending call(s): {}",
                cancelled, reason
            ));
        }

        if uptime.as_millis() >= u128::from(self.settings.max_restart_delay_ms) {
            supervisor.restart_attempts.store(0, Ordering::SeqCst);
        }
        if restart {
            self.schedule_restart();
        }
    }

    fn schedule_restart(self: &Arc<Self>) {
        let attempt = self.supervisor.restart_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.settings.restart_delay(attempt);
        self.logger.info(&format!(
            "Restarting worker in {}ms (attempt {})",
            delay.as_millis(),
            attempt + 1
        ));

        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            // From here on the restart must not be aborted halfway.
            shared
                .supervisor
                .restart_timer
                .lock_or_recover("Shared::schedule_restart")
                .take();
            if let Err(e) = Shared::restart_after_backoff(shared).await {
                log::debug!(
                    target: "tsunagi::bridge::supervisor",
                    "Automatic restart failed: {}",
                    e
                );
            }
        });

        if let Some(previous) = self
            .supervisor
            .restart_timer
            .lock_or_recover("Shared::schedule_restart")
            .replace(timer)
        {
            previous.abort();
        }
    }

    fn restart_after_backoff(self: Arc<Self>) -> StartFuture {
        Box::pin(async move { self.start_worker(None, StartTrigger::Restart).await })
    }
}
