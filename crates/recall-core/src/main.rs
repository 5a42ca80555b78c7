//! Recall - Persistent memory for multi-tenant assistants
//!
//! Stores facts about users' clients, projects and preferences, retrieves
//! them for new conversations and extracts new ones from finished turns.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recall::config::{self, LogFormat};
use recall::{api, AppState, Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so LOG_FORMAT from .env applies
    let config = config::init();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "recall=debug,tower_http=debug".into());
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!(
        "Starting Recall server on {}:{}",
        config.server.host,
        config.server.port
    );

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    // Initialize application state
    let state = AppState::new().await?.with_metrics(metrics);
    tracing::info!("Application state initialized");

    let queue = state.memory.queue().clone();
    let app = api::app(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid listen address: {}", e)))?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let queued embeddings land before exiting
    queue.wait_idle().await;
    tracing::info!("Recall server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
