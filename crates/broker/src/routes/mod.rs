//! HTTP routes

pub mod events;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{state::AppState, websocket::ws_handler};

/// Largest accepted publish request body (1MB)
const MAX_PUBLISH_BODY_BYTES: usize = 1024 * 1024;

/// Create all broker routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // WebSocket route (auth handled in handler via query parameter or header)
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    let mut router = Router::new().merge(health_routes).merge(websocket_routes);

    // Internal publish endpoint, only when a secret is configured
    if state.publish_secret.is_some() {
        router = router.route(
            "/internal/events",
            post(events::publish_event).layer(DefaultBodyLimit::max(MAX_PUBLISH_BODY_BYTES)),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
