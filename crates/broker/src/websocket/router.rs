//! Topic router
//!
//! Resolves an event's topics against the registry and hands the event to the
//! queue of every matching connection exactly once. Routing never waits on a
//! socket: enqueue is non-blocking and a full queue evicts its oldest entry.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::connection::Connection;
use super::events::{Event, Outbound};
use super::queue::Enqueue;
use super::registry::SessionRegistry;

/// Outcome of dispatching one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Connections the event was queued for
    pub recipients: usize,
    /// Recipients whose queue had to drop its oldest entry
    pub evicted: usize,
    /// Matching connections that were already closing
    pub skipped: usize,
}

/// Cumulative delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub events_routed: u64,
    pub deliveries: u64,
    pub evictions: u64,
    pub unrouted: u64,
}

#[derive(Default)]
struct Counters {
    events_routed: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
    unrouted: AtomicU64,
}

pub struct TopicRouter {
    registry: Arc<SessionRegistry>,
    counters: Counters,
}

impl TopicRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            counters: Counters::default(),
        }
    }

    /// Union of the subscribers of every event topic, each connection once.
    ///
    /// Order follows the event's topic order, then registry order.
    pub fn route(&self, event: &Event) -> Vec<Arc<Connection>> {
        let mut seen = HashSet::new();
        self.registry
            .lookup_by_topics(&event.topics)
            .into_iter()
            .flatten()
            .filter(|conn| seen.insert(conn.id))
            .collect()
    }

    /// Queue the event for every routed connection
    pub fn dispatch(&self, event: Arc<Event>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for conn in self.route(&event) {
            if !conn.state().accepts_events() {
                report.skipped += 1;
                continue;
            }

            match conn.enqueue(Outbound::Event(Arc::clone(&event))) {
                Enqueue::Queued => report.recipients += 1,
                Enqueue::Evicted(oldest) => {
                    report.recipients += 1;
                    report.evicted += 1;
                    tracing::debug!(
                        connection_id = %conn.id,
                        user_id = %conn.user_id(),
                        dropped_event_id = ?oldest.event_id(),
                        "Outbound queue full, evicted oldest entry"
                    );
                }
                Enqueue::Closed => report.skipped += 1,
            }
        }

        self.counters.events_routed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .deliveries
            .fetch_add(report.recipients as u64, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        if report.recipients == 0 {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            event_id = event.id,
            kind = %event.kind,
            recipients = report.recipients,
            evicted = report.evicted,
            skipped = report.skipped,
            "Dispatched event"
        );

        report
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            events_routed: self.counters.events_routed.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            unrouted: self.counters.unrouted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionState;
    use livesync_shared::{EventKind, Identity, Record, ServerMessage, Topic};

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn event(id: u64, topics: &[&str]) -> Arc<Event> {
        Arc::new(
            Event::new(
                id,
                EventKind::NewNotice,
                topics.iter().map(|t| topic(t)).collect(),
                ServerMessage::NewNotice {
                    notice: Record::new(format!("n-{id}")),
                },
            )
            .unwrap(),
        )
    }

    fn setup() -> (Arc<SessionRegistry>, TopicRouter) {
        let registry = Arc::new(SessionRegistry::new());
        let router = TopicRouter::new(Arc::clone(&registry));
        (registry, router)
    }

    fn connect(registry: &SessionRegistry, user: &str, topics: &[&str], capacity: usize) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(Identity::new(user, "student"), capacity));
        registry.register(Arc::clone(&conn), topics.iter().map(|t| topic(t)));
        conn
    }

    #[test]
    fn test_overlapping_topics_deliver_once() {
        let (registry, router) = setup();
        let a = connect(&registry, "u-1", &["notices", "branch:cse"], 8);

        let report = router.dispatch(event(1, &["notices", "branch:cse"]));
        assert_eq!(report.recipients, 1);
        assert_eq!(a.pending(), 1);
    }

    #[test]
    fn test_only_subscribers_receive() {
        let (registry, router) = setup();
        let a = connect(&registry, "u-1", &["materials"], 8);
        let b = connect(&registry, "u-2", &["notices"], 8);

        let report = router.dispatch(event(1, &["materials"]));
        assert_eq!(report.recipients, 1);
        assert_eq!(a.pending(), 1);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn test_no_subscribers_is_counted_unrouted() {
        let (_registry, router) = setup();
        let report = router.dispatch(event(1, &["courses"]));
        assert_eq!(report, DispatchReport::default());
        assert_eq!(router.stats().unrouted, 1);
        assert_eq!(router.stats().events_routed, 1);
    }

    #[test]
    fn test_closing_connection_is_skipped() {
        let (registry, router) = setup();
        let a = connect(&registry, "u-1", &["materials"], 8);
        a.advance(ConnectionState::Closing);

        let report = router.dispatch(event(1, &["materials"]));
        assert_eq!(report.recipients, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn test_slow_consumer_evicts_without_affecting_others() {
        let (registry, router) = setup();
        let slow = connect(&registry, "u-1", &["materials"], 2);
        let fast = connect(&registry, "u-2", &["materials"], 8);

        for id in 1..=3 {
            router.dispatch(event(id, &["materials"]));
        }

        assert_eq!(slow.pending(), 2);
        assert_eq!(slow.evicted(), 1);
        assert_eq!(fast.pending(), 3);
        assert_eq!(router.stats().evictions, 1);
        assert_eq!(router.stats().deliveries, 6);

        let remaining: Vec<_> = std::iter::from_fn(|| slow.queue().try_pop())
            .filter_map(|item| item.event_id())
            .collect();
        assert_eq!(remaining, vec![2, 3]);
    }
}
