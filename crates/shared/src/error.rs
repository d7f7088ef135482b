//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding or validating frames on an open connection.
///
/// These never escalate to a disconnect on the broker side: the offending
/// connection receives an `error` frame and stays open.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Not allowed to subscribe to topic {0}")]
    ForbiddenTopic(String),

    #[error("Unexpected message before the connection is open")]
    NotOpen,

    #[error("Binary frames are not supported")]
    Binary,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
