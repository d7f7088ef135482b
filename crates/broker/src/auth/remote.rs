//! Remote identity verification
//!
//! Used when access tokens are issued by a service whose signing key the broker
//! does not hold. The token is posted to the identity endpoint, which answers
//! with the identity JSON (`{userId, role, branch?, semester?}`).

use std::time::Duration;

use async_trait::async_trait;
use livesync_shared::Identity;
use reqwest::{Client, StatusCode};

use super::IdentityVerifier;
use crate::error::AuthError;

/// Timeout for identity verification requests (5 seconds)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RemoteVerifier {
    client: Client,
    endpoint: String,
}

impl RemoteVerifier {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for RemoteVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Identity endpoint request failed");
                AuthError::Unavailable(e.to_string())
            })?;

        match response.status() {
            status if status.is_success() => response.json::<Identity>().await.map_err(|e| {
                tracing::error!(error = %e, "Identity endpoint returned an unreadable body");
                AuthError::Unavailable(e.to_string())
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Invalid),
            status => {
                tracing::warn!(status = %status, "Identity endpoint returned an unexpected status");
                Err(AuthError::Unavailable(format!("identity endpoint returned {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livesync_shared::UserId;

    #[tokio::test]
    async fn test_remote_identity_accepted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/verify")
            .match_header("authorization", "Bearer good-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"userId":"u-5","role":"faculty","branch":"ece"}"#)
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url())).unwrap();
        let identity = verifier.verify("good-token").await.unwrap();

        assert_eq!(identity.user_id, UserId::from("u-5"));
        assert_eq!(identity.role, "faculty");
        assert_eq!(identity.branch.as_deref(), Some("ece"));
        assert_eq!(identity.semester, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_remote_rejection_is_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(401)
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url())).unwrap();
        assert!(matches!(verifier.verify("bad").await, Err(AuthError::Invalid)));
    }

    #[tokio::test]
    async fn test_remote_outage_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(503)
            .create_async()
            .await;

        let verifier = RemoteVerifier::new(format!("{}/verify", server.url())).unwrap();
        assert!(matches!(
            verifier.verify("any").await,
            Err(AuthError::Unavailable(_))
        ));
    }
}
