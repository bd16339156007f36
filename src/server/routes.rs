//! Axum route handlers for the aggregation server.
//!
//! # Routes
//!
//! - `GET  /health`       — Returns `{"status": "ok", "version": ..., "service": "embodiment"}`
//! - `POST /updates`      — Accepts `SubmitRequest`, buffers the update
//! - `POST /aggregate`    — Merges the buffered round (409 below quorum)
//! - `GET  /global-model` — Latest merged model (404 before the first round)
//! - `GET  /status`       — Round and buffer counters

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::FederatedConfig;
use crate::federated::client::SubmitRequest;
use crate::federated::{AggregationServer, GlobalModelUpdate, ReceiveResult, ServerStatus};

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<AggregationServer>,
}

impl AppState {
    pub fn new(server: Arc<AggregationServer>) -> Self {
        Self { server }
    }

    pub fn from_config(config: &FederatedConfig) -> Self {
        Self::new(Arc::new(AggregationServer::from_config(config)))
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/updates", post(receive_update_handler))
        .route("/aggregate", post(aggregate_handler))
        .route("/global-model", get(global_model_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "embodiment",
    }))
}

/// POST /updates — buffer one client's update for the current round.
async fn receive_update_handler(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<ReceiveResult>, (StatusCode, Json<Value>)> {
    if request.client_id.trim().is_empty() {
        return Err(error_body(StatusCode::BAD_REQUEST, "client_id must not be empty"));
    }
    let receipt = state
        .server
        .receive_update(&request.client_id, request.update);
    tracing::debug!(
        client_id = %request.client_id,
        total_updates = receipt.total_updates,
        can_aggregate = receipt.can_aggregate,
        "update received"
    );
    Ok(Json(receipt))
}

/// POST /aggregate — merge the buffered round.
async fn aggregate_handler(
    State(state): State<AppState>,
) -> Result<Json<GlobalModelUpdate>, (StatusCode, Json<Value>)> {
    if !state.server.can_aggregate() {
        let status = state.server.status();
        return Err(error_body(
            StatusCode::CONFLICT,
            format!(
                "{} of {} required clients have reported",
                status.distinct_clients, status.min_clients_for_aggregation
            ),
        ));
    }
    match state.server.perform_aggregation() {
        Some(model) => {
            tracing::info!(
                round = model.aggregation_round,
                participants = model.participant_count,
                "aggregation round complete"
            );
            Ok(Json(model))
        }
        None => Err(error_body(
            StatusCode::CONFLICT,
            "no usable updates in the current round",
        )),
    }
}

/// GET /global-model — latest merged model.
async fn global_model_handler(
    State(state): State<AppState>,
) -> Result<Json<GlobalModelUpdate>, (StatusCode, Json<Value>)> {
    state
        .server
        .get_global_model()
        .map(Json)
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "no aggregation round has completed"))
}

/// GET /status — counters.
async fn status_handler(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.server.status())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
