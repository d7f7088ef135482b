//! Client error types

use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Unsupported URL scheme {0}, expected ws or wss")]
    UnsupportedScheme(String),
    #[error("Client is already connected")]
    AlreadyConnected,
    #[error("Failed to obtain credentials: {0}")]
    Credentials(String),
    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),
}
