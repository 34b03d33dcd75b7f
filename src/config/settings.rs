use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a single bridge instance.
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Timeout for `send_request` when the caller gives none
    pub default_timeout_ms: u64,
    /// First delay before restarting a crashed worker
    pub restart_delay_ms: u64,
    /// Ceiling for the doubling restart delay
    pub max_restart_delay_ms: u64,
    /// How long a worker gets between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
    /// Pause after spawning before `start` returns
    pub settle_delay_ms: u64,
    pub auto_restart: bool,
    /// Cap on concurrently pending outward calls; unlimited when absent
    pub max_pending_calls: Option<usize>,
    /// Attach error detail to error responses sent to the worker
    pub verbose: bool,
    pub worker: Option<WorkerCommand>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            restart_delay_ms: 1_000,
            max_restart_delay_ms: 30_000,
            kill_grace_ms: 2_000,
            settle_delay_ms: 200,
            auto_restart: true,
            max_pending_calls: None,
            verbose: false,
            worker: None,
        }
    }
}

impl BridgeSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Restart delay for the given number of consecutive failed attempts.
    ///
    /// Doubles per attempt starting at `restart_delay_ms`, never exceeding
    /// `max_restart_delay_ms`.
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .restart_delay_ms
            .saturating_mul(factor)
            .min(self.max_restart_delay_ms.max(self.restart_delay_ms));
        Duration::from_millis(delay)
    }
}

/// How to launch the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Run once before the first successful start (e.g. dependency fetch)
    pub prepare: Option<PrepareStep>,
}

impl WorkerCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            prepare: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn prepare(mut self, step: PrepareStep) -> Self {
        self.prepare = Some(step);
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One-time step run before the worker is first spawned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrepareStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PrepareStep {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}
