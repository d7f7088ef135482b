//! WebSocket connection management
//!
//! Represents one authenticated socket: its identity, lifecycle state and the
//! bounded outbound queue drained by its delivery worker.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use livesync_shared::{Identity, UserId};
use uuid::Uuid;

use super::events::{CloseRequest, Outbound};
use super::queue::{Enqueue, OutboundQueue};

/// Connection lifecycle. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether events may still be queued for this connection
    pub fn accepts_events(self) -> bool {
        matches!(self, ConnectionState::Authenticated | ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Represents an active WebSocket connection
pub struct Connection {
    /// Unique id for this socket
    pub id: Uuid,

    /// Identity resolved at handshake
    pub identity: Identity,

    pub connected_at: Instant,

    state: Mutex<ConnectionState>,
    last_seen: Mutex<Instant>,
    queue: OutboundQueue,
}

impl Connection {
    /// Create a connection for a verified identity
    pub fn new(identity: Identity, queue_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            connected_at: now,
            state: Mutex::new(ConnectionState::Authenticated),
            last_seen: Mutex::new(now),
            queue: OutboundQueue::new(queue_capacity),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Advance the lifecycle state. Backwards moves are ignored.
    ///
    /// Returns whether the state changed.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = lock(&self.state);
        if next <= *state {
            return false;
        }
        tracing::debug!(
            connection_id = %self.id,
            from = %*state,
            to = %next,
            "Connection state changed"
        );
        *state = next;
        true
    }

    /// Record inbound activity from the peer
    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    /// Time since the peer was last heard from
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    /// Queue an item for delivery. Never blocks.
    pub fn enqueue(&self, item: Outbound) -> Enqueue {
        self.queue.push(item)
    }

    /// Stop accepting items and ask the worker to close the socket once
    /// everything already queued has been written.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.advance(ConnectionState::Closing);
        self.queue.close(Some(Outbound::Close(CloseRequest {
            code,
            reason: reason.into(),
        })));
    }

    /// Stop accepting items without sending a close frame
    pub fn shutdown(&self) {
        self.advance(ConnectionState::Closing);
        self.queue.close(None);
    }

    /// Number of items waiting for the worker
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of entries dropped because the queue was full
    pub fn evicted(&self) -> u64 {
        self.queue.evicted_count()
    }

    pub(crate) fn queue(&self) -> &OutboundQueue {
        &self.queue
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(Identity::new("u-1", "student"), 4)
    }

    #[test]
    fn test_new_connection_is_authenticated() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.user_id().as_str(), "u-1");
        assert!(conn.state().accepts_events());
    }

    #[test]
    fn test_state_only_moves_forward() {
        let conn = connection();
        assert!(conn.advance(ConnectionState::Open));
        assert!(!conn.advance(ConnectionState::Authenticated));
        assert_eq!(conn.state(), ConnectionState::Open);

        assert!(conn.advance(ConnectionState::Closed));
        assert!(!conn.advance(ConnectionState::Closing));
        assert!(!conn.state().accepts_events());
    }

    #[test]
    fn test_close_queues_close_request_last() {
        let conn = connection();
        conn.enqueue(Outbound::error("first"));
        conn.close(1008, "policy");

        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(matches!(conn.enqueue(Outbound::error("late")), Enqueue::Closed));
        assert!(matches!(conn.queue().try_pop(), Some(Outbound::Direct(_))));
        match conn.queue().try_pop() {
            Some(Outbound::Close(request)) => {
                assert_eq!(request.code, 1008);
                assert_eq!(request.reason, "policy");
            }
            other => panic!("Expected close request, got {other:?}"),
        }
    }

    #[test]
    fn test_touch_resets_idle_time() {
        let conn = connection();
        std::thread::sleep(Duration::from_millis(15));
        assert!(conn.idle_for() >= Duration::from_millis(15));
        conn.touch();
        assert!(conn.idle_for() < Duration::from_millis(15));
    }
}
