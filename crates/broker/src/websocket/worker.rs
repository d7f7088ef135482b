//! Delivery worker
//!
//! One task per connection. Drains the connection's outbound queue in FIFO
//! order onto the socket and owns the keepalive: a ping every keepalive
//! interval, and a close once the peer has been silent past the idle timeout.
//! A failed write ends the connection; nothing is retried.

use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::connection::{Connection, ConnectionState};
use super::events::Outbound;
use super::registry::SessionRegistry;
use crate::config::LiveSyncSettings;

/// Why a delivery worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Queue closed and drained without a close request
    QueueClosed,
    /// A close request was written
    Closed,
    /// Socket write failed
    WriteFailed,
    /// Peer silent past the idle timeout
    IdleTimeout,
}

pub struct DeliveryWorker<S> {
    conn: Arc<Connection>,
    registry: Arc<SessionRegistry>,
    sink: S,
    keepalive_interval: Duration,
    idle_timeout: Duration,
}

impl<S> DeliveryWorker<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    pub fn new(
        conn: Arc<Connection>,
        registry: Arc<SessionRegistry>,
        sink: S,
        settings: &LiveSyncSettings,
    ) -> Self {
        Self {
            conn,
            registry,
            sink,
            keepalive_interval: settings.keepalive_interval,
            idle_timeout: settings.idle_timeout,
        }
    }

    /// Run until the queue closes, a write fails or the peer goes idle.
    ///
    /// On exit the connection is unregistered and its queue closed, so the
    /// router stops targeting it.
    pub async fn run(mut self) -> WorkerExit {
        let mut keepalive = interval_at(
            Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;

                item = self.conn.queue().pop() => match item {
                    Some(Outbound::Close(request)) => {
                        let frame = CloseFrame {
                            code: request.code,
                            reason: Cow::Owned(request.reason),
                        };
                        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
                            tracing::debug!(connection_id = %self.conn.id, error = %e, "Close frame not delivered");
                        }
                        break WorkerExit::Closed;
                    }
                    Some(item) => {
                        // The peer can only answer once this frame is out
                        if item.is_handshake() {
                            self.conn.advance(ConnectionState::Open);
                        }
                        if let Err(e) = self.write(item).await {
                            tracing::warn!(
                                connection_id = %self.conn.id,
                                user_id = %self.conn.user_id(),
                                error = %e,
                                "WebSocket write failed, closing connection"
                            );
                            break WorkerExit::WriteFailed;
                        }
                    }
                    None => break WorkerExit::QueueClosed,
                },

                _ = keepalive.tick() => {
                    if self.conn.idle_for() >= self.idle_timeout {
                        tracing::info!(
                            connection_id = %self.conn.id,
                            user_id = %self.conn.user_id(),
                            idle_secs = self.conn.idle_for().as_secs(),
                            "Connection idle, closing"
                        );
                        let frame = CloseFrame {
                            code: close_code::AWAY,
                            reason: Cow::Borrowed("idle timeout"),
                        };
                        let _ = self.sink.send(Message::Close(Some(frame))).await;
                        break WorkerExit::IdleTimeout;
                    }
                    if let Err(e) = self.sink.send(Message::Ping(Vec::new())).await {
                        tracing::warn!(connection_id = %self.conn.id, error = %e, "Keepalive ping failed");
                        break WorkerExit::WriteFailed;
                    }
                }
            }
        };

        self.finish(exit).await;
        exit
    }

    async fn write(&mut self, item: Outbound) -> Result<(), S::Error> {
        let text = match item {
            Outbound::Event(event) => event.wire().to_string(),
            Outbound::Direct(frame) => match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize WebSocket frame");
                    return Ok(());
                }
            },
            Outbound::Close(_) => return Ok(()),
        };
        self.sink.send(Message::Text(text)).await
    }

    async fn finish(&mut self, exit: WorkerExit) {
        self.conn.advance(ConnectionState::Closing);
        self.registry.unregister(&self.conn.id);
        self.conn.queue().close(None);
        self.conn.queue().clear();

        let _ = self.sink.close().await;
        self.conn.advance(ConnectionState::Closed);

        tracing::debug!(
            connection_id = %self.conn.id,
            exit = ?exit,
            evicted = self.conn.evicted(),
            "Delivery worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use livesync_shared::{EventKind, Identity, Record, ServerFrame, ServerMessage, Topic};
    use serde_json::Value;

    use crate::websocket::events::Event;

    fn settings(keepalive_ms: u64, idle_ms: u64) -> LiveSyncSettings {
        LiveSyncSettings {
            keepalive_interval: Duration::from_millis(keepalive_ms),
            idle_timeout: Duration::from_millis(idle_ms),
            ..LiveSyncSettings::default()
        }
    }

    fn registered(registry: &SessionRegistry) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(Identity::new("u-1", "student"), 8));
        registry.register(Arc::clone(&conn), [Topic::broadcast()]);
        conn
    }

    fn text(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_writes_queue_in_order() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = registered(&registry);
        let (tx, mut rx) = mpsc::unbounded();

        conn.enqueue(Outbound::direct(ServerMessage::Authenticated {
            user_id: conn.user_id().clone(),
        }));
        let event = Event::new(
            1,
            EventKind::CourseLaunched,
            vec![Topic::broadcast()],
            ServerMessage::CourseLaunched {
                course: Record::new("c-1"),
            },
        )
        .unwrap();
        conn.enqueue(Outbound::Event(Arc::new(event)));

        let worker = DeliveryWorker::new(Arc::clone(&conn), Arc::clone(&registry), tx, &settings(10_000, 60_000));
        let handle = tokio::spawn(worker.run());

        assert_eq!(text(rx.next().await.unwrap())["type"], "authenticated");
        assert_eq!(conn.state(), ConnectionState::Open);
        let second = text(rx.next().await.unwrap());
        assert_eq!(second["type"], "course_launched");
        assert_eq!(second["eventId"], 1);

        conn.shutdown();
        assert_eq!(handle.await.unwrap(), WorkerExit::QueueClosed);
        assert!(!registry.contains(&conn.id));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_request_flushes_pending_first() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = registered(&registry);
        let (tx, mut rx) = mpsc::unbounded();

        conn.enqueue(Outbound::error("connection not open"));
        conn.close(close_code::POLICY, "not open");

        let worker = DeliveryWorker::new(Arc::clone(&conn), Arc::clone(&registry), tx, &settings(10_000, 60_000));
        assert_eq!(worker.run().await, WorkerExit::Closed);

        assert_eq!(text(rx.next().await.unwrap())["type"], "error");
        match rx.next().await.unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::POLICY),
            other => panic!("Expected close frame, got {other:?}"),
        }
        assert!(!registry.contains(&conn.id));
    }

    #[tokio::test]
    async fn test_connection_stays_authenticated_until_handshake_written() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = registered(&registry);
        let (tx, mut rx) = mpsc::unbounded();

        conn.enqueue(Outbound::direct(ServerMessage::Pong));
        let worker = DeliveryWorker::new(Arc::clone(&conn), Arc::clone(&registry), tx, &settings(10_000, 60_000));
        let handle = tokio::spawn(worker.run());

        assert_eq!(text(rx.next().await.unwrap())["type"], "pong");
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        conn.enqueue(Outbound::direct(ServerMessage::Authenticated {
            user_id: conn.user_id().clone(),
        }));
        assert_eq!(text(rx.next().await.unwrap())["type"], "authenticated");
        assert_eq!(conn.state(), ConnectionState::Open);

        conn.shutdown();
        assert_eq!(handle.await.unwrap(), WorkerExit::QueueClosed);
    }

    #[tokio::test]
    async fn test_write_failure_unregisters() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = registered(&registry);
        let (tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);

        conn.enqueue(Outbound::direct(ServerMessage::Pong));
        let worker = DeliveryWorker::new(Arc::clone(&conn), Arc::clone(&registry), tx, &settings(10_000, 60_000));

        assert_eq!(worker.run().await, WorkerExit::WriteFailed);
        assert!(!registry.contains(&conn.id));
        assert!(conn.queue().is_closed());
    }

    #[tokio::test]
    async fn test_keepalive_pings_then_idle_close() {
        let registry = Arc::new(SessionRegistry::new());
        let conn = registered(&registry);
        let (tx, mut rx) = mpsc::unbounded();

        let worker = DeliveryWorker::new(Arc::clone(&conn), Arc::clone(&registry), tx, &settings(20, 70));
        let exit = tokio::time::timeout(Duration::from_secs(2), worker.run())
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::IdleTimeout);

        let mut frames = Vec::new();
        while let Ok(Some(message)) = rx.try_next() {
            frames.push(message);
        }
        assert!(matches!(frames.first(), Some(Message::Ping(_))));
        match frames.last() {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::AWAY),
            other => panic!("Expected idle close, got {other:?}"),
        }
        assert!(!registry.contains(&conn.id));
    }

    #[test]
    fn test_direct_frame_encoding() {
        let frame = ServerFrame::now(ServerMessage::Pong);
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value.get("eventId").is_none());
    }
}
