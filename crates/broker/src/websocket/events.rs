//! Published events and outbound items
//!
//! An [`Event`] is immutable once published and shared by every recipient's
//! queue through an `Arc`; its wire form is encoded once at publish time.

use std::sync::Arc;

use livesync_shared::protocol::millis;
use livesync_shared::{EventId, EventKind, ServerFrame, ServerMessage, Topic};
use time::OffsetDateTime;

/// A stamped catalog event
#[derive(Debug)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub topics: Vec<Topic>,
    pub message: ServerMessage,
    pub created_at: OffsetDateTime,
    wire: Arc<str>,
}

impl Event {
    pub(crate) fn new(
        id: EventId,
        kind: EventKind,
        topics: Vec<Topic>,
        message: ServerMessage,
    ) -> Result<Self, serde_json::Error> {
        let created_at = OffsetDateTime::now_utc();
        let frame = ServerFrame {
            event_id: Some(id),
            timestamp: millis(created_at),
            message,
        };
        let wire: Arc<str> = frame.encode()?.into();

        Ok(Self {
            id,
            kind,
            topics,
            message: frame.message,
            created_at,
            wire,
        })
    }

    /// Encoded JSON frame, identical for every recipient
    pub fn wire(&self) -> &str {
        &self.wire
    }
}

/// Close request queued behind any pending frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// One item in a connection's outbound queue
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Catalog event fanned out by the router
    Event(Arc<Event>),
    /// Frame addressed to this connection only (authenticated, error, pong)
    Direct(ServerFrame),
    /// Close the socket after everything queued before it
    Close(CloseRequest),
}

impl Outbound {
    pub fn direct(message: ServerMessage) -> Self {
        Outbound::Direct(ServerFrame::now(message))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Outbound::direct(ServerMessage::Error {
            message: message.into(),
        })
    }

    /// Catalog events may be evicted from a full queue; control frames are kept
    pub fn is_evictable(&self) -> bool {
        matches!(self, Outbound::Event(_))
    }

    /// The `authenticated` frame that opens a connection
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Outbound::Direct(ServerFrame {
                message: ServerMessage::Authenticated { .. },
                ..
            })
        )
    }

    pub fn event_id(&self) -> Option<EventId> {
        match self {
            Outbound::Event(event) => Some(event.id),
            Outbound::Direct(frame) => frame.event_id,
            Outbound::Close(_) => None,
        }
    }
}
