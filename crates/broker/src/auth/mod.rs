//! Handshake authentication
//!
//! The gateway treats token verification as an opaque call through
//! [`IdentityVerifier`], injected via application state.

pub mod jwt;
pub mod remote;

use async_trait::async_trait;
use livesync_shared::Identity;

use crate::error::AuthError;

pub use jwt::{Claims, JwtVerifier};
pub use remote::RemoteVerifier;

/// Resolves an access token to the identity it was issued for
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Tries the locally signed JWT first and falls back to the remote identity
/// endpoint for tokens the local key cannot validate.
///
/// Expired local tokens are not retried remotely: the client must refresh.
pub struct ChainedVerifier {
    local: JwtVerifier,
    remote: RemoteVerifier,
}

impl ChainedVerifier {
    pub fn new(local: JwtVerifier, remote: RemoteVerifier) -> Self {
        Self { local, remote }
    }
}

#[async_trait]
impl IdentityVerifier for ChainedVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        match self.local.verify(token).await {
            Ok(identity) => Ok(identity),
            Err(AuthError::Expired) => Err(AuthError::Expired),
            Err(e) => {
                tracing::debug!(error = %e, "Local token validation failed, trying identity endpoint");
                self.remote.verify(token).await
            }
        }
    }
}
