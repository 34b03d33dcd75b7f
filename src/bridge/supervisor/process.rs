//! Worker process plumbing: preparation step, spawn and termination.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::{PrepareStep, WorkerCommand};
use crate::error::{BridgeError, BridgeResult};

/// A freshly spawned worker with its stdio taken.
pub(crate) struct SpawnedWorker {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
}

/// How a worker process ended.
#[derive(Debug)]
pub(crate) struct WorkerExit {
    code: Option<i32>,
    /// The supervisor asked the worker to stop
    requested: bool,
    error: Option<String>,
}

impl WorkerExit {
    pub(crate) fn from_wait(result: io::Result<ExitStatus>, requested: bool) -> Self {
        match result {
            Ok(status) => Self {
                code: status.code(),
                requested,
                error: None,
            },
            Err(e) => Self {
                code: None,
                requested,
                error: Some(e.to_string()),
            },
        }
    }

    /// Clean exits never trigger a restart.
    pub(crate) fn is_clean(&self) -> bool {
        self.requested || (self.error.is_none() && self.code == Some(0))
    }

    /// Reason handed to every call cancelled by this exit.
    pub(crate) fn reason(&self) -> String {
        if self.requested {
            return "worker stopped".to_string();
        }
        match (&self.error, self.code) {
            (Some(error), _) => format!("worker process error: {}", error),
            (None, Some(code)) => format!("worker exited with code {}", code),
            (None, None) => "worker terminated by signal".to_string(),
        }
    }
}

/// Run the one-time preparation step and wait for it.
pub(crate) async fn run_prepare(step: &PrepareStep, working_dir: Option<&Path>) -> BridgeResult<()> {
    let mut command = Command::new(&step.command);
    command
        .args(&step.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    log::info!(
        target: "tsunagi::bridge::supervisor",
        "Running preparation step '{}'",
        step.command
    );
    let output = command
        .output()
        .await
        .map_err(|e| BridgeError::prepare(format!("failed to run '{}': {}", step.command, e)))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let mut message = format!("'{}' exited with {}", step.command, output.status);
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(stderr);
    }
    Err(BridgeError::prepare(message))
}

/// Spawn the worker with all three stdio streams piped.
///
/// The child is killed if its handle is dropped.
pub(crate) fn spawn_worker(worker: &WorkerCommand) -> BridgeResult<SpawnedWorker> {
    let mut command = Command::new(&worker.command);
    command
        .args(&worker.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &worker.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| BridgeError::Spawn {
        command: worker.display(),
        source,
    })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    match (stdin, stdout, stderr) {
        (Some(stdin), Some(stdout), Some(stderr)) => Ok(SpawnedWorker {
            child,
            stdin,
            stdout,
            stderr,
        }),
        _ => Err(BridgeError::transport(format!(
            "failed to capture stdio of '{}'",
            worker.display()
        ))),
    }
}

/// Terminate the worker and reap it.
///
/// Unix: SIGTERM, then SIGKILL if the process is still alive after `grace`.
/// Elsewhere the process is killed right away.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            log::debug!(
                target: "tsunagi::bridge::supervisor",
                "Sending SIGTERM to worker {}",
                pid
            );
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                log::warn!(
                    target: "tsunagi::bridge::supervisor",
                    "SIGTERM to worker {} failed: {}",
                    pid,
                    e
                );
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(result) => return result,
            Err(_) => {
                log::warn!(
                    target: "tsunagi::bridge::supervisor",
                    "Worker did not exit within {:?}, sending SIGKILL",
                    grace
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.start_kill() {
        log::warn!(
            target: "tsunagi::bridge::supervisor",
            "Failed to kill worker: {}",
            e
        );
    }
    child.wait().await
}
