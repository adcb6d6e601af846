// Main entry point for the worker: consumes broker messages and executes
// registered handlers against the job ledger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use conveyor_core::kernel::broker::NatsBroker;
use conveyor_core::kernel::handlers::standard_registry;
use conveyor_core::kernel::jobs::{OperationCatalog, WorkerConfig, WorkerRuntime};
use conveyor_core::kernel::Kernel;
use conveyor_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "conveyor-worker", about = "Conveyor background worker")]
struct Args {
    /// Queue to consume.
    #[arg(long, default_value = "default")]
    queue: String,

    /// Simulated stage duration for the mock pipeline, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    mock_stage_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conveyor_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting Conveyor worker");

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let broker = Arc::new(
        NatsBroker::connect(&config.nats_url)
            .await
            .context("Failed to connect to broker")?,
    );

    let registry = Arc::new(standard_registry(Duration::from_millis(args.mock_stage_ms)));

    // Refuse to start half-configured: every task the platform can enqueue
    // must have a handler on this instance.
    for task_name in OperationCatalog::standard().task_names() {
        if !registry.is_registered(task_name) {
            bail!("no handler registered for task {task_name}");
        }
    }

    let worker_config = WorkerConfig {
        queue: args.queue,
        min_backoff_ms: config.worker_min_backoff_ms,
        max_backoff_ms: config.worker_max_backoff_ms,
        max_retries: config.worker_max_retries,
        ..WorkerConfig::default()
    };

    let kernel = Arc::new(Kernel::postgres(config, pool, broker));
    let runtime = Arc::new(WorkerRuntime::with_config(kernel, registry, worker_config));

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    runtime
        .run(shutdown)
        .await
        .context("Worker runtime error")?;

    Ok(())
}
