// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Emotion Recognition API Server
//!
//! Accepts speech recordings, predicts the expressed emotion and keeps a
//! searchable history of predictions.

use emotion_api::{
    config::Config,
    db::MongoDb,
    services::{PredictionService, RateLimitService},
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging
    init_logging();

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        dev_mode = config.dev_mode,
        api_base_url = config.api_base_url(),
        "Starting Emotion Recognition API"
    );

    // Rate limiter (falls back to in-memory without Redis)
    let rate_limiter = RateLimitService::connect(&config.redis).await;
    tracing::info!(
        backend = rate_limiter.backend().await,
        "Rate limiter initialized"
    );

    // Prediction history (runs offline without MongoDB)
    let db = MongoDb::connect(&config.mongo).await;

    // Load classifier
    let model_path = config.svm_model_path();
    tracing::info!(path = %model_path.display(), "Loading emotion model");
    let prediction_service = tokio::task::spawn_blocking(move || PredictionService::load(model_path))
        .await?;
    if !prediction_service.is_ready() {
        tracing::warn!("No emotion model loaded, prediction requests will return 503");
    }

    // Build shared state
    let bind_address = config.bind_address();
    let state = Arc::new(AppState {
        config,
        db,
        rate_limiter,
        prediction_service,
    });

    // Build router
    let app = emotion_api::routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging.
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,emotion_api=debug"));

    tracing_subscriber::registry().with(filter).with(format).init();
}
