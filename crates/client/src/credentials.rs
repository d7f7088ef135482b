//! Handshake credentials

use async_trait::async_trait;
use livesync_shared::UserId;

use crate::error::ClientError;

/// Access token presented at handshake, with the user it was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    /// Sent as `userId`; the broker rejects the handshake if it does not match
    pub user_id: Option<UserId>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Source of handshake credentials.
///
/// `refresh` is called after the broker refused a handshake as expired or
/// unauthorized, before the next reconnect attempt.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current(&self) -> Result<Credentials, ClientError>;

    async fn refresh(&self) -> Result<Credentials, ClientError> {
        self.current().await
    }
}

/// Fixed credentials; refreshing returns the same token
#[async_trait]
impl CredentialProvider for Credentials {
    async fn current(&self) -> Result<Credentials, ClientError> {
        Ok(self.clone())
    }
}
