//! Broker error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use livesync_shared::ProtocolError;
use serde_json::json;
use uuid::Uuid;

// =============================================================================
// Handshake
// =============================================================================

/// WebSocket close code: access token expired, client should refresh it
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;

/// WebSocket close code: missing, invalid, or mismatched credentials
pub const CLOSE_UNAUTHORIZED: u16 = 4003;

/// WebSocket close code: server-side failure, retry without re-authenticating
pub const CLOSE_INTERNAL: u16 = 1011;

/// Handshake authentication failure. No connection is ever registered for it.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing access token")]
    MissingToken,
    #[error("Access token has expired")]
    Expired,
    #[error("Invalid access token")]
    Invalid,
    #[error("Token does not belong to the requested user")]
    UserMismatch,
    #[error("Identity verifier unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Close code sent to the client when refusing the handshake
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::Expired => CLOSE_TOKEN_EXPIRED,
            AuthError::MissingToken | AuthError::Invalid | AuthError::UserMismatch => {
                CLOSE_UNAUTHORIZED
            }
            AuthError::Unavailable(_) => CLOSE_INTERNAL,
        }
    }

    /// Short reason placed in the close frame
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing token",
            AuthError::Expired => "token expired",
            AuthError::Invalid => "invalid token",
            AuthError::UserMismatch => "user mismatch",
            AuthError::Unavailable(_) => "identity verifier unavailable",
        }
    }
}

// =============================================================================
// Registry / Publishing
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event must target at least one topic")]
    NoTopics,
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] ProtocolError),
    #[error("Message type {0} is not a publishable event")]
    NotAnEvent(&'static str),
    #[error("Failed to encode event: {0}")]
    Encoding(#[source] serde_json::Error),
}

// =============================================================================
// HTTP
// =============================================================================

/// Error type for the broker's HTTP routes
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Resource not found")]
    NotFound,
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Encoding(e) => {
                tracing::error!(error = %e, "Failed to encode published event");
                ApiError::Internal
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// Result type alias for HTTP handlers
pub type ApiResult<T> = Result<T, ApiError>;
