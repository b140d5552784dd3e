//! # dasgate — data-acquisition gateway task engine
//!
//! Loads the task list, arms every auto-start task and answers console
//! commands on stdin until EOF or Ctrl-C.
//!
//! Usage:
//!   dasgate                              # ~/.dasgate/config.toml
//!   dasgate --config site.toml           # Custom config
//!   dasgate --tasks ./tasks.toml -v      # Override the task file, debug logging

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dasgate_core::GatewayConfig;
use dasgate_scheduler::{
    ConfirmRequest, Confirmation, ManagerSettings, MemoryStore, OutputKind, OutputSink, Sinks,
    StreamSink, TaskManager, TimerPool,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dasgate", version, about = "📡 dasgate — acquisition gateway task engine")]
struct Cli {
    /// Config file (default: ~/.dasgate/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Task file, overrides tasks.file from the config
    #[arg(short, long)]
    tasks: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Stand-in for an external transport: logs what would have been sent.
struct LoggingSink {
    kind: OutputKind,
}

impl OutputSink for LoggingSink {
    fn deliver(&self, reference: &str, payload: &str) -> bool {
        tracing::info!("📤 {} -> {reference}: {payload}", self.kind);
        true
    }
}

/// Logs stream writes and confirms every expected reply right away.
struct LoggingStream;

impl StreamSink for LoggingStream {
    fn write(&self, stream: &str, payload: &str) -> bool {
        tracing::info!("📤 stream {stream}: {payload}");
        true
    }

    fn register_confirmation(&self, request: ConfirmRequest) -> bool {
        tracing::info!(
            "📤 stream {}: {} (expecting '{}')",
            request.stream,
            request.payload,
            request.expected_reply
        );
        request
            .reply_to
            .send(Confirmation {
                key: request.key,
                success: true,
            })
            .is_ok()
    }
}

fn logging_sinks() -> Sinks {
    [
        OutputKind::Email,
        OutputKind::Sms,
        OutputKind::Mqtt,
        OutputKind::Telnet,
        OutputKind::I2c,
    ]
    .into_iter()
    .fold(Sinks::new(), |sinks, kind| {
        sinks.with(kind, Arc::new(LoggingSink { kind }))
    })
    .with_stream(Arc::new(LoggingStream))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "dasgate=debug,dasgate_scheduler=debug"
    } else {
        "dasgate=info,dasgate_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load_from(&expand_path(path))?,
        None => GatewayConfig::load()?,
    };
    if let Some(tasks) = &cli.tasks {
        config.tasks.file = expand_path(tasks).to_string_lossy().into_owned();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.tasks.worker_threads)
        .thread_name("dasgate-task")
        .enable_all()
        .build()
        .context("Failed to build the worker pool")?;
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<()> {
    tracing::info!(
        "📡 {} starting ({} task workers)",
        config.id,
        config.tasks.worker_threads
    );

    let manager = TaskManager::builder(ManagerSettings::from_config(&config))
        .store(Arc::new(MemoryStore::new()))
        .sinks(logging_sinks())
        .build(TimerPool::current()?);

    if !manager.reload_tasks() {
        tracing::warn!(
            "⚠️ No tasks loaded from {}",
            config.tasks_file().display()
        );
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => println!("{}", manager.reply_to_command(&line)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Interrupted");
                break;
            }
        }
    }

    let stopped = manager.stop_all("shutdown");
    manager.shutdown_and_clear_all();
    tracing::info!("👋 {} stopped ({stopped} tasks cancelled)", config.id);
    Ok(())
}
