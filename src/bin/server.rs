//! Aggregation server binary.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8090)
//! - `EMBODIMENT_CONFIG` — Optional YAML config file
//! - `EMBODIMENT_FEDERATED_MIN_CLIENTS_FOR_AGGREGATION` — Quorum per round
//! - `EMBODIMENT_FEDERATED_MODEL_VERSION` — Base model version
//! - `RUST_LOG` — Tracing filter (default: "info,embodiment=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! ```

use anyhow::Context;
use embodiment::config::EmbodimentConfig;
use embodiment::server::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,embodiment=debug".into()),
        )
        .init();

    let config = match std::env::var("EMBODIMENT_CONFIG") {
        Ok(path) => EmbodimentConfig::load(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => EmbodimentConfig::from_env(),
    };

    let port = std::env::var("PORT").unwrap_or_else(|_| "8090".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let state = AppState::from_config(&config.federated);
    let app = app_router(state);

    tracing::info!("embodiment aggregation server starting on {}", bind_addr);
    tracing::info!(
        "Model version {}, quorum {} client(s)",
        config.federated.model_version,
        config.federated.min_clients_for_aggregation
    );
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health       — liveness probe");
    tracing::info!("  POST /updates      — submit a client update");
    tracing::info!("  POST /aggregate    — merge the current round");
    tracing::info!("  GET  /global-model — latest merged model");
    tracing::info!("  GET  /status       — round counters");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
