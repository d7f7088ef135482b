//! Internal event publishing
//!
//! Lets a REST layer running in another process publish catalog events after
//! its writes commit. Guarded by a shared bearer secret.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use livesync_shared::{EventKind, ServerMessage, Topic};
use serde::Deserialize;
use serde_json::Value;
use subtle::ConstantTimeEq;

use crate::error::{ApiError, ApiResult, PublishError};
use crate::state::AppState;
use crate::websocket::Published;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub topics: Vec<Topic>,
    pub payload: Value,
}

/// POST /internal/events
pub async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Published>> {
    let secret = state.publish_secret.as_deref().ok_or(ApiError::NotFound)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !bool::from(presented.as_bytes().ct_eq(secret.as_bytes())) {
        tracing::warn!("Publish request with invalid secret");
        return Err(ApiError::Unauthorized);
    }

    let request: PublishRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid publish request: {e}")))?;

    let message = ServerMessage::from_event(request.kind, request.payload)
        .map_err(PublishError::from)?;
    let published = state.publisher.publish_message(request.topics, message)?;

    Ok(Json(published))
}
