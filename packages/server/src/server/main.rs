// Main entry point for the API server: HTTP ingest/status/vector surface
// plus the in-process outbox dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conveyor_core::kernel::broker::NatsBroker;
use conveyor_core::kernel::jobs::{DispatcherConfig, OutboxDispatcher};
use conveyor_core::kernel::Kernel;
use conveyor_core::server::build_app;
use conveyor_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conveyor_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conveyor API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(env = %config.app_env, "Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Connect to broker
    let broker = Arc::new(
        NatsBroker::connect(&config.nats_url)
            .await
            .context("Failed to connect to broker")?,
    );

    let port = config.port;
    let dispatcher_config = DispatcherConfig {
        interval: Duration::from_millis(config.outbox_dispatch_interval_ms),
        batch_size: config.outbox_claim_batch_size,
    };

    let kernel = Arc::new(Kernel::postgres(config, pool, broker));

    // Outbox dispatcher runs alongside the HTTP server and drains pending
    // rows to the broker; ingest itself never publishes.
    let shutdown = CancellationToken::new();
    let dispatcher = OutboxDispatcher::with_config(
        Arc::clone(&kernel.store),
        Arc::clone(&kernel.broker),
        dispatcher_config,
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown.clone()));

    // Build application
    let app = build_app(kernel);

    // Start server
    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{port}/healthz");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Let the dispatcher finish its in-flight tick.
    shutdown.cancel();
    let _ = dispatcher_handle.await;

    Ok(())
}
