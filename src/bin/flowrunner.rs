//! flowrunner CLI - run a flow locally through the full worker stack.
//!
//! Usage:
//!   flowrunner run path/to/flow.json --payload '{"value": 2}'
//!   flowrunner pieces

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;

use flowrunner::{
    FlowGraph, FlowRunStatus, MemoryBackend, MemoryJobQueue, Worker, WorkerConfig,
    flow::RunEnvironment,
    observability::{self, ObservabilityOptions},
    pieces::builtin,
};

#[derive(Parser, Debug)]
#[command(name = "flowrunner", about = "Run automation flows in sandboxed engines")]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a flow definition and print its run report
    Run {
        /// Path to the flow graph JSON file
        flow_file: PathBuf,

        /// Trigger payload as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Overrides FLOWRUNNER_CONCURRENCY
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Overrides FLOWRUNNER_SANDBOX_MEMORY_MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Seconds to wait for the run to finish or pause
        #[arg(short, long, default_value = "120")]
        timeout: u64,
    },
    /// List the pieces compiled into the engine
    Pieces,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    observability::init(ObservabilityOptions {
        json: args.log_json,
        ..ObservabilityOptions::default()
    });

    match args.command {
        Command::Run {
            flow_file,
            payload,
            concurrency,
            memory_mb,
            timeout,
        } => run(flow_file, &payload, concurrency, memory_mb, Duration::from_secs(timeout)).await,
        Command::Pieces => {
            let metadata = builtin::registry().metadata();
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
    }
}

async fn run(
    flow_file: PathBuf,
    payload: &str,
    concurrency: Option<usize>,
    memory_mb: Option<u64>,
    wait: Duration,
) -> Result<()> {
    let raw = fs::read_to_string(&flow_file)
        .with_context(|| format!("failed to read flow file: {}", flow_file.display()))?;
    let flow: FlowGraph = serde_json::from_str(&raw)
        .with_context(|| format!("invalid flow definition: {}", flow_file.display()))?;
    let payload: Value = serde_json::from_str(payload).context("--payload must be JSON")?;

    let mut config = WorkerConfig::from_env()?;
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(memory_mb) = memory_mb {
        config.memory_limit_mb = (memory_mb > 0).then_some(memory_mb);
    }

    let backend = Arc::new(MemoryBackend::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let worker = Worker::start(&config, queue.clone(), Arc::clone(&backend));

    let run = worker
        .runs()
        .start_run(flow, payload, RunEnvironment::Testing)
        .await?;
    info!(run_id = %run.id, "waiting for flow run");

    let started = Instant::now();
    let report = loop {
        if let Some(report) = backend.run_reports().into_iter().find(|r| r.run_id == run.id) {
            break serde_json::to_value(&report)?;
        }
        if let Some(paused) = backend.paused_runs().into_iter().find(|p| p.run_id == run.id) {
            let mut value = serde_json::to_value(&paused)?;
            value["status"] = json!(FlowRunStatus::Paused);
            break value;
        }
        if started.elapsed() > wait {
            worker.shutdown().await?;
            bail!("flow run {} did not settle within {wait:?}", run.id);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    worker.shutdown().await?;
    Ok(())
}
