//! Event publisher
//!
//! The single entry point the REST layer calls after a mutation has been
//! persisted. Publishing is fire-and-forget: it stamps the next event id,
//! fans the event out to every subscriber queue and returns without waiting
//! on any socket.

use std::sync::{Arc, Mutex, PoisonError};

use livesync_shared::{EventId, EventKind, ServerMessage, Topic};
use serde::Serialize;
use serde_json::Value;

use super::events::Event;
use super::router::TopicRouter;
use crate::error::PublishError;

/// Result of a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub event_id: EventId,
    pub recipients: usize,
}

pub struct EventPublisher {
    router: Arc<TopicRouter>,
    /// Next id to stamp. Held across dispatch so that every queue sees
    /// events in id order.
    next_id: Mutex<EventId>,
}

impl EventPublisher {
    pub fn new(router: Arc<TopicRouter>) -> Self {
        Self {
            router,
            next_id: Mutex::new(1),
        }
    }

    /// Publish a catalog event from its kind and raw payload
    pub fn publish(
        &self,
        kind: EventKind,
        topics: Vec<Topic>,
        payload: Value,
    ) -> Result<EventId, PublishError> {
        let message = ServerMessage::from_event(kind, payload)?;
        self.publish_message(topics, message)
            .map(|published| published.event_id)
    }

    /// Publish an already-built catalog message
    pub fn publish_message(
        &self,
        topics: Vec<Topic>,
        message: ServerMessage,
    ) -> Result<Published, PublishError> {
        let kind = message
            .kind()
            .ok_or(PublishError::NotAnEvent(message.type_name()))?;

        let mut unique = Vec::with_capacity(topics.len());
        for topic in topics {
            if !unique.contains(&topic) {
                unique.push(topic);
            }
        }
        if unique.is_empty() {
            return Err(PublishError::NoTopics);
        }

        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let event_id = *next_id;
        let event = Event::new(event_id, kind, unique, message).map_err(PublishError::Encoding)?;
        *next_id += 1;

        let report = self.router.dispatch(Arc::new(event));
        drop(next_id);

        tracing::info!(
            event_id,
            kind = %kind,
            recipients = report.recipients,
            "Published event"
        );

        Ok(Published {
            event_id,
            recipients: report.recipients,
        })
    }

    /// Id the next published event will carry
    pub fn peek_next_id(&self) -> EventId {
        *self.next_id.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
