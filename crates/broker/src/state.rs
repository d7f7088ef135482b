//! Application state shared by every route

use std::sync::Arc;

use crate::auth::{ChainedVerifier, IdentityVerifier, JwtVerifier, RemoteVerifier};
use crate::config::{Config, LiveSyncSettings};
use crate::websocket::{EventPublisher, Gateway, SessionRegistry, TopicRouter};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<TopicRouter>,
    pub publisher: Arc<EventPublisher>,
    pub gateway: Arc<Gateway>,
    /// Bearer secret for the internal publish endpoint; `None` disables it
    pub publish_secret: Option<Arc<str>>,
}

impl AppState {
    /// Wire the live sync components around an identity verifier
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        settings: LiveSyncSettings,
        publish_secret: Option<String>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(TopicRouter::new(Arc::clone(&registry)));
        let publisher = Arc::new(EventPublisher::new(Arc::clone(&router)));
        let gateway = Arc::new(Gateway::new(verifier, Arc::clone(&registry), settings));

        Self {
            registry,
            router,
            publisher,
            gateway,
            publish_secret: publish_secret.map(Arc::from),
        }
    }

    /// Build state from configuration.
    ///
    /// Uses local JWT validation, falling back to the identity endpoint when
    /// `IDENTITY_VERIFY_URL` is set.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let local = JwtVerifier::new(&config.jwt_secret);
        let verifier: Arc<dyn IdentityVerifier> = match &config.identity_verify_url {
            Some(url) => {
                tracing::info!(endpoint = %url, "Remote identity verification enabled");
                Arc::new(ChainedVerifier::new(local, RemoteVerifier::new(url.clone())?))
            }
            None => Arc::new(local),
        };

        Ok(Self::new(
            verifier,
            config.live.clone(),
            config.publish_secret.clone(),
        ))
    }
}
