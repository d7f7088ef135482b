//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::websocket::{DeliveryStats, RegistryStats};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub registry: RegistryStats,
    pub delivery: DeliveryStats,
    pub next_event_id: u64,
}

/// Health check endpoint with registry and delivery counters
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        registry: state.registry.stats(),
        delivery: state.router.stats(),
        next_event_id: state.publisher.peek_next_id(),
    })
}

/// Liveness check (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
