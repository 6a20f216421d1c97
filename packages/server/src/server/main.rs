// Main entry point for the job runtime: dispatcher, reaper, bus forwarder
// and the SSE edge, in one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::config::Config;
use server_core::kernel::bus::{spawn_forwarder, LocalStreamBus, NatsStreamBus, StreamBus};
use server_core::kernel::jobs::{JobRegistry, JobWorker, Reaper};
use server_core::kernel::sse::SseState;
use server_core::kernel::{ServerDeps, StreamHub};
use server_core::server::routes;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting job runtime");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

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

    let shutdown = CancellationToken::new();
    let hub = StreamHub::with_config(&config.sse);

    // Cross-replica bus, or an in-process loopback when NATS is absent.
    let bus: Arc<dyn StreamBus> = match &config.nats_url {
        Some(url) => {
            let client = async_nats::connect(url.as_str())
                .await
                .context("Failed to connect to NATS")?;
            spawn_forwarder(client.clone(), hub.clone(), shutdown.clone());
            tracing::info!("Stream bus connected");
            Arc::new(NatsStreamBus::new(client))
        }
        None => {
            tracing::warn!("NATS_URL not set; running with the in-process stream bus");
            Arc::new(LocalStreamBus::new(hub.clone()))
        }
    };

    let deps = Arc::new(ServerDeps::postgres(
        pool,
        hub.clone(),
        bus,
        config.jobs.clone(),
        config.sse.clone(),
    ));

    // Domain handlers register here at process init.
    let registry = Arc::new(JobRegistry::new());

    let worker = Arc::new(JobWorker::new(deps.clone(), registry.clone()));
    tracing::info!(worker_id = worker.worker_id(), "starting dispatcher");
    let worker_handle = worker.spawn(shutdown.clone());
    let reaper_handle = Reaper::new(deps.clone()).spawn(shutdown.clone());

    // SSE edge
    let state = SseState {
        hub,
        keep_alive: config.sse.heartbeat,
    };
    let app = routes::stream::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Serving SSE streams on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
            serve_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = worker_handle.await;
    let _ = reaper_handle.await;
    tracing::info!("Job runtime stopped");

    Ok(())
}
