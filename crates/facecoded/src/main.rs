use anyhow::{Context, Result};
use facecode_core::Extractor;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod routes;
mod worker;

use config::Config;
use routes::AppState;
use worker::WorkerPool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind,
        max_concurrent = config.max_concurrent,
        timeout_secs = config.request_timeout_secs,
        "facecoded starting"
    );

    let pipeline = config.pipeline().context("invalid pipeline configuration")?;
    tracing::info!(model_dir = %pipeline.model_dir.display(), "loading models");
    let extractor = tokio::task::spawn_blocking(move || Extractor::load(&pipeline))
        .await?
        .context("failed to load models")?;
    tracing::info!(
        encoder = extractor.encoder_name(),
        strategies = ?extractor.strategy_names(),
        dimension = extractor.dimension(),
        "models loaded"
    );

    let pool = WorkerPool::new(Arc::new(extractor), config.max_concurrent, config.request_timeout());
    let app = routes::router(AppState { pool }, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "facecoded ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facecoded shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
