//! Connection gateway
//!
//! Terminates the handshake and owns the per-connection control protocol:
//! credential verification, default topic assignment, registration, and the
//! handling of subscribe / unsubscribe / ping frames.

use std::sync::Arc;

use axum::extract::ws::close_code;
use axum::http::{header, HeaderMap};
use livesync_shared::{ClientFrame, Identity, ProtocolError, ServerMessage, Topic, UserId};
use serde::Deserialize;

use super::connection::{Connection, ConnectionState};
use super::events::Outbound;
use super::queue::Enqueue;
use super::registry::SessionRegistry;
use crate::auth::IdentityVerifier;
use crate::config::LiveSyncSettings;
use crate::error::AuthError;

/// Query parameters accepted on the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
}

/// Credentials extracted from an upgrade request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub token: Option<String>,
    /// User the client claims to be; must match the verified identity
    pub user_id: Option<UserId>,
}

impl HandshakeRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Query token first (`token`, then `access_token`), then the bearer header
    pub fn from_parts(params: HandshakeParams, headers: &HeaderMap) -> Self {
        let token = params
            .token
            .or(params.access_token)
            .filter(|t| !t.is_empty())
            .or_else(|| bearer_token(headers));

        Self {
            token,
            user_id: params.user_id.filter(|u| !u.is_empty()).map(UserId),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// What the read loop should do after a client frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// The gateway has asked the worker to close the socket
    Close,
}

pub struct Gateway {
    verifier: Arc<dyn IdentityVerifier>,
    registry: Arc<SessionRegistry>,
    settings: LiveSyncSettings,
}

impl Gateway {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        registry: Arc<SessionRegistry>,
        settings: LiveSyncSettings,
    ) -> Self {
        Self {
            verifier,
            registry,
            settings,
        }
    }

    pub fn settings(&self) -> &LiveSyncSettings {
        &self.settings
    }

    /// Verify the handshake credentials. Nothing is registered on failure.
    pub async fn authenticate(&self, request: &HandshakeRequest) -> Result<Identity, AuthError> {
        let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;
        let identity = self.verifier.verify(token).await?;

        if let Some(claimed) = &request.user_id {
            if *claimed != identity.user_id {
                tracing::warn!(
                    claimed = %claimed,
                    verified = %identity.user_id,
                    "Handshake user does not match token"
                );
                return Err(AuthError::UserMismatch);
            }
        }

        Ok(identity)
    }

    /// Create and register a connection for a verified identity.
    ///
    /// The connection starts `Authenticated` with its default topics, and its
    /// queue already holds the `authenticated` frame. It becomes `Open` when
    /// the delivery worker writes that frame; client frames arriving earlier
    /// are refused.
    pub fn open(&self, identity: Identity) -> Arc<Connection> {
        let topics = Topic::defaults_for(&identity);
        let conn = Arc::new(Connection::new(identity, self.settings.queue_capacity));

        conn.enqueue(Outbound::direct(ServerMessage::Authenticated {
            user_id: conn.user_id().clone(),
        }));
        self.registry.register(Arc::clone(&conn), topics);

        conn
    }

    /// Authenticate and open in one step
    pub async fn accept(&self, request: &HandshakeRequest) -> Result<Arc<Connection>, AuthError> {
        let identity = self.authenticate(request).await?;
        Ok(self.open(identity))
    }

    /// Handle one inbound text frame
    pub fn handle_text(&self, conn: &Connection, text: &str) -> FrameOutcome {
        conn.touch();

        if conn.state() != ConnectionState::Open {
            return self.reject_not_open(conn);
        }

        match ClientFrame::decode(text) {
            Ok(frame) => self.handle_frame(conn, frame),
            Err(e) => self.reply_error(conn, &e),
        }
        FrameOutcome::Continue
    }

    /// Handle one inbound binary frame; the protocol is text-only
    pub fn handle_binary(&self, conn: &Connection) -> FrameOutcome {
        conn.touch();

        if conn.state() != ConnectionState::Open {
            return self.reject_not_open(conn);
        }
        self.reply_error(conn, &ProtocolError::Binary);
        FrameOutcome::Continue
    }

    fn handle_frame(&self, conn: &Connection, frame: ClientFrame) {
        match frame {
            ClientFrame::Subscribe { topic } => {
                if !topic.permits(&conn.identity) {
                    self.reply_error(conn, &ProtocolError::ForbiddenTopic(topic.to_string()));
                    return;
                }
                if let Err(e) = self.registry.subscribe(&conn.id, topic) {
                    tracing::debug!(connection_id = %conn.id, error = %e, "Subscribe on departed connection");
                }
            }
            ClientFrame::Unsubscribe { topic } => {
                if let Err(e) = self.registry.unsubscribe(&conn.id, &topic) {
                    tracing::debug!(connection_id = %conn.id, error = %e, "Unsubscribe on departed connection");
                }
            }
            ClientFrame::Ping => {
                conn.enqueue(Outbound::direct(ServerMessage::Pong));
            }
        }
    }

    fn reply_error(&self, conn: &Connection, error: &ProtocolError) {
        tracing::debug!(connection_id = %conn.id, error = %error, "Rejected client frame");
        if let Enqueue::Closed = conn.enqueue(Outbound::error(error.to_string())) {
            tracing::debug!(connection_id = %conn.id, "Error reply dropped, connection closing");
        }
    }

    fn reject_not_open(&self, conn: &Connection) -> FrameOutcome {
        tracing::warn!(
            connection_id = %conn.id,
            state = %conn.state(),
            "Client frame received before connection was open"
        );
        conn.enqueue(Outbound::error(ProtocolError::NotOpen.to_string()));
        conn.close(close_code::POLICY, "connection not open");
        FrameOutcome::Close
    }

    /// Tear down a connection whose socket has ended
    pub fn disconnect(&self, conn: &Connection) {
        conn.shutdown();
        self.registry.unregister(&conn.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use livesync_shared::ServerFrame;

    /// Accepts `<user>:<role>` tokens; `expired` and `down` simulate failures
    struct StaticVerifier;

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
            match token {
                "expired" => Err(AuthError::Expired),
                "down" => Err(AuthError::Unavailable("connection refused".to_string())),
                _ => {
                    let (user, role) = token.split_once(':').ok_or(AuthError::Invalid)?;
                    Ok(Identity::new(user, role).with_branch("cse").with_semester(3))
                }
            }
        }
    }

    fn gateway() -> (Arc<SessionRegistry>, Gateway) {
        let registry = Arc::new(SessionRegistry::new());
        let gateway = Gateway::new(
            Arc::new(StaticVerifier),
            Arc::clone(&registry),
            LiveSyncSettings::default(),
        );
        (registry, gateway)
    }

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn next_message(conn: &Connection) -> ServerMessage {
        match conn.queue().try_pop() {
            Some(Outbound::Direct(ServerFrame { message, .. })) => message,
            other => panic!("Expected direct frame, got {other:?}"),
        }
    }

    async fn open_connection(gateway: &Gateway) -> Arc<Connection> {
        let conn = gateway.accept(&HandshakeRequest::new("u-1:student")).await.unwrap();
        conn.advance(ConnectionState::Open);
        next_message(&conn);
        conn
    }

    #[test]
    fn test_token_sources_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));

        let from_query = HandshakeRequest::from_parts(
            HandshakeParams {
                token: Some("query-token".to_string()),
                access_token: Some("alias-token".to_string()),
                user_id: Some("u-1".to_string()),
            },
            &headers,
        );
        assert_eq!(from_query.token.as_deref(), Some("query-token"));
        assert_eq!(from_query.user_id, Some(UserId::from("u-1")));

        let from_alias = HandshakeRequest::from_parts(
            HandshakeParams {
                access_token: Some("alias-token".to_string()),
                ..HandshakeParams::default()
            },
            &headers,
        );
        assert_eq!(from_alias.token.as_deref(), Some("alias-token"));

        let from_header = HandshakeRequest::from_parts(HandshakeParams::default(), &headers);
        assert_eq!(from_header.token.as_deref(), Some("header-token"));

        let none = HandshakeRequest::from_parts(HandshakeParams::default(), &HeaderMap::new());
        assert_eq!(none.token, None);
    }

    #[tokio::test]
    async fn test_accept_registers_with_default_topics() {
        let (registry, gateway) = gateway();
        let conn = gateway.accept(&HandshakeRequest::new("u-1:student")).await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert!(registry.contains(&conn.id));
        let topics = registry.topics_of(&conn.id).unwrap();
        for expected in ["broadcast", "user:u-1", "role:student", "branch:cse", "semester:cse:3"] {
            assert!(topics.contains(&topic(expected)), "missing {expected}");
        }

        assert_eq!(
            next_message(&conn),
            ServerMessage::Authenticated {
                user_id: UserId::from("u-1")
            }
        );
    }

    #[tokio::test]
    async fn test_auth_failures_leave_no_trace() {
        let (registry, gateway) = gateway();

        let cases = [
            (HandshakeRequest::default(), 4003),
            (HandshakeRequest::new("garbage"), 4003),
            (HandshakeRequest::new("expired"), 4001),
            (HandshakeRequest::new("down"), 1011),
            (HandshakeRequest::new("u-1:student").for_user("u-2"), 4003),
        ];
        for (request, code) in cases {
            let err = gateway.accept(&request).await.unwrap_err();
            assert_eq!(err.close_code(), code, "{request:?}");
        }
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (registry, gateway) = gateway();
        let conn = open_connection(&gateway).await;

        let outcome = gateway.handle_text(&conn, r#"{"action":"subscribe","topic":"materials"}"#);
        assert_eq!(outcome, FrameOutcome::Continue);
        assert!(registry.topics_of(&conn.id).unwrap().contains(&topic("materials")));
        assert!(conn.queue().is_empty());

        gateway.handle_text(&conn, r#"{"action":"unsubscribe","topic":"materials"}"#);
        assert!(!registry.topics_of(&conn.id).unwrap().contains(&topic("materials")));
    }

    #[tokio::test]
    async fn test_foreign_identity_topic_is_refused() {
        let (registry, gateway) = gateway();
        let conn = open_connection(&gateway).await;

        gateway.handle_text(&conn, r#"{"action":"subscribe","topic":"user:u-2"}"#);
        assert!(matches!(next_message(&conn), ServerMessage::Error { .. }));
        assert!(!registry.topics_of(&conn.id).unwrap().contains(&topic("user:u-2")));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (registry, gateway) = gateway();
        let conn = open_connection(&gateway).await;

        for bad in ["not json", r#"{"action":"dance"}"#, r#"{"action":"subscribe"}"#] {
            assert_eq!(gateway.handle_text(&conn, bad), FrameOutcome::Continue);
            assert!(matches!(next_message(&conn), ServerMessage::Error { .. }));
        }
        assert_eq!(gateway.handle_binary(&conn), FrameOutcome::Continue);
        assert!(matches!(next_message(&conn), ServerMessage::Error { .. }));

        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(registry.contains(&conn.id));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (_registry, gateway) = gateway();
        let conn = open_connection(&gateway).await;

        gateway.handle_text(&conn, r#"{"action":"ping"}"#);
        assert_eq!(next_message(&conn), ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_frame_before_open_is_rejected_and_closed() {
        let (_registry, gateway) = gateway();
        let conn = gateway.accept(&HandshakeRequest::new("u-1:student")).await.unwrap();
        next_message(&conn);

        let outcome = gateway.handle_text(&conn, r#"{"action":"ping"}"#);
        assert_eq!(outcome, FrameOutcome::Close);
        assert!(matches!(next_message(&conn), ServerMessage::Error { .. }));
        assert!(matches!(conn.queue().try_pop(), Some(Outbound::Close(_))));
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_authenticated_survives_event_burst_before_first_write() {
        use crate::websocket::events::Event;
        use crate::websocket::router::TopicRouter;
        use livesync_shared::EventKind;

        let registry = Arc::new(SessionRegistry::new());
        let settings = LiveSyncSettings {
            queue_capacity: 2,
            ..LiveSyncSettings::default()
        };
        let gateway = Gateway::new(Arc::new(StaticVerifier), Arc::clone(&registry), settings);
        let router = TopicRouter::new(Arc::clone(&registry));

        let conn = gateway.accept(&HandshakeRequest::new("u-1:student")).await.unwrap();
        for id in 1..=3 {
            let event = Event::new(
                id,
                EventKind::NoticeDeleted,
                vec![Topic::broadcast()],
                ServerMessage::NoticeDeleted {
                    notice_id: format!("n-{id}"),
                },
            )
            .unwrap();
            router.dispatch(Arc::new(event));
        }

        assert!(matches!(next_message(&conn), ServerMessage::Authenticated { .. }));
        let rest: Vec<_> = std::iter::from_fn(|| conn.queue().try_pop())
            .map(|item| item.event_id())
            .collect();
        assert_eq!(rest, vec![Some(3)]);
    }

    #[tokio::test]
    async fn test_disconnect_unregisters() {
        let (registry, gateway) = gateway();
        let conn = open_connection(&gateway).await;

        gateway.disconnect(&conn);
        assert!(!registry.contains(&conn.id));
        assert!(conn.queue().is_closed());
    }
}
