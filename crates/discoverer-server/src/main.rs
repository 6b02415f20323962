//! Discoverer REST API Server
//!
//! This binary starts the Discoverer REST API server, exposing endpoints for
//! observation ingestion, the published index, and dataset requests. With
//! `--embedded-worker` it also runs the task worker in-process.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use discoverer_client::WorkerControl;
use discoverer_core::{
    ActivityInterceptor, TaskRouter, TracingWorkerReporter, WorkerService, load_config,
};
use discoverer_db::run_migrations;

use discoverer_server::{AppState, ServerConfig, create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command line arguments
    let config = ServerConfig::parse();
    let settings = load_config(config.config.clone()).context("Failed to load configuration")?;

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to apply database schema")?;
    info!("Database connection established");

    // Create shutdown token for graceful shutdown
    let shutdown_token = CancellationToken::new();

    // Without Heroku credentials the worker runs elsewhere (or embedded) and
    // is never stopped on idle.
    let worker_control = WorkerControl::from_heroku_env(
        config.heroku_api_key.as_deref(),
        config.heroku_app_name.as_deref(),
        WorkerControl::External,
    )
    .context("Invalid worker control configuration")?;
    info!(control = worker_control.name(), "Worker control configured");

    // Create application state
    let app_state = AppState::new(pool, &settings, worker_control, shutdown_token.clone());

    let worker_handle = if config.embedded_worker {
        let controller = app_state.idle_controller();
        let worker = WorkerService::new(
            app_state.task_repo.clone(),
            TaskRouter::new(app_state.dataset_cache.clone(), controller.clone()),
            ActivityInterceptor::new(controller),
            settings.worker.worker_config(),
        );
        let token = shutdown_token.clone();
        info!(worker_id = worker.worker_id(), "Starting embedded worker");
        Some(tokio::spawn(async move {
            if let Err(e) = worker.run(token, &TracingWorkerReporter).await {
                error!(error = %e, "Embedded worker failed");
            }
        }))
    } else {
        None
    };

    // Build router
    let app = create_router(app_state, &config.cors_origins);

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!("Starting Discoverer API server on http://{}", addr);
    info!("Swagger UI available at http://{}/swagger-ui", addr);

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_token))
        .await
        .context("Server error")?;

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Embedded worker task panicked");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");

    // Cancel the shutdown token to signal the embedded worker
    shutdown_token.cancel();

    // Give the worker time to finish its current task
    tokio::time::sleep(Duration::from_secs(2)).await;
}
