//! JWT access token validation
//!
//! Tokens are issued by the portal's REST layer; the broker only validates
//! them and reads the identity out of the claims.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use livesync_shared::{Identity, UserId};
use serde::{Deserialize, Serialize};

use super::IdentityVerifier;
use crate::error::AuthError;

/// JWT claims structure for portal-issued access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// User role (student, faculty, admin, ...)
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<u8>,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

impl Claims {
    pub fn into_identity(self) -> Identity {
        Identity {
            user_id: UserId(self.sub),
            role: self.role,
            branch: self.branch,
            semester: self.semester,
        }
    }
}

/// Validates HS256 access tokens signed with the shared portal secret
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate and decode a token
    /// Explicit algorithm validation prevents algorithm confusion attacks
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        match self.validate_token(token) {
            Ok(claims) => Ok(claims.into_identity()),
            Err(JwtError::Expired) => Err(AuthError::Expired),
            Err(e) => {
                tracing::debug!(error = %e, "JWT validation failed");
                Err(AuthError::Invalid)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(expires_in: Duration) -> Claims {
        let now = OffsetDateTime::now_utc();
        Claims {
            sub: "u-1".to_string(),
            role: "student".to_string(),
            branch: Some("cse".to_string()),
            semester: Some(3),
            iat: now.unix_timestamp(),
            exp: (now + expires_in).unix_timestamp(),
        }
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let verifier = JwtVerifier::new(SECRET);
        let token = sign(&claims(Duration::hours(1)), SECRET);

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, UserId::from("u-1"));
        assert_eq!(identity.role, "student");
        assert_eq!(identity.branch.as_deref(), Some("cse"));
        assert_eq!(identity.semester, Some(3));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let verifier = JwtVerifier::new(SECRET);
        // Beyond the 60 second leeway
        let token = sign(&claims(Duration::minutes(-10)), SECRET);

        assert!(matches!(verifier.verify(&token).await, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn test_wrong_secret_and_garbage() {
        let verifier = JwtVerifier::new(SECRET);
        let token = sign(&claims(Duration::hours(1)), "another-secret-key-at-least-32-chars");

        assert!(matches!(verifier.verify(&token).await, Err(AuthError::Invalid)));
        assert!(matches!(verifier.verify("not-a-jwt").await, Err(AuthError::Invalid)));
    }
}
