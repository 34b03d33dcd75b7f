use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tsunagi::config::load_settings;
use tsunagi::{LogForwarder, ProcessBridge, RequestOptions, WorkerCommand, builtin_methods};

/// Talk to a worker process over a bidirectional JSON-RPC bridge
#[derive(Parser)]
#[command(name = "tsunagi")]
#[command(version)]
#[command(about = "Talk to a worker process over a bidirectional JSON-RPC bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker, send one request and print the result
    Call {
        #[command(flatten)]
        target: Target,

        /// Response deadline in milliseconds (default: from configuration)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Start the worker and send one notification
    Notify {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// Method to invoke on the worker
    method: String,

    /// JSON params (default: {})
    #[arg(long, default_value = "{}")]
    params: String,

    /// Configuration file (default: $TSUNAGI_CONFIG, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory for the worker (overrides the configured one)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Worker command line; the configured worker is used when omitted
    #[arg(last = true)]
    worker: Vec<String>,
}

impl Target {
    fn params(&self) -> Result<Value, String> {
        serde_json::from_str(&self.params).map_err(|e| format!("--params is not valid JSON: {}", e))
    }

    /// The worker given after `--`, else the configured one, with `--cwd`
    /// applied to whichever is used.
    fn worker_command(&self, configured: Option<&WorkerCommand>) -> Option<WorkerCommand> {
        let mut command = match self.worker.split_first() {
            Some((program, args)) => WorkerCommand::new(program.as_str()).args(args.iter().cloned()),
            None => configured?.clone(),
        };
        if let Some(dir) = &self.cwd {
            command = command.working_dir(dir.clone());
        }
        Some(command)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), String> {
    let target = match &command {
        Commands::Call { target, .. } | Commands::Notify { target } => target,
    };
    let params = target.params()?;
    let settings = load_settings(target.config.as_deref()).map_err(|e| e.to_string())?;

    let worker = target.worker_command(settings.worker.as_ref());
    let bridge = ProcessBridge::new(settings, builtin_methods(), Arc::new(LogForwarder));
    let started = match worker {
        Some(worker) => bridge.start(worker).await,
        None => bridge.start_configured().await,
    };
    started.map_err(|e| e.to_string())?;

    let outcome = match &command {
        Commands::Call { target, timeout_ms } => {
            let options = RequestOptions {
                timeout: timeout_ms.map(Duration::from_millis),
            };
            match bridge.send_request(&target.method, params, options).await {
                Ok(result) => serde_json::to_string_pretty(&result)
                    .map(|text| println!("{}", text))
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        Commands::Notify { target } => {
            bridge.send_notification(&target.method, params);
            bridge.flush().await.map_err(|e| e.to_string())
        }
    };

    bridge.stop().await;
    outcome
}
