//! Session registry
//!
//! Owns the connection index: connection id → connection, user id →
//! connections, topic → connections. All three indexes live behind a single
//! lock so that a reader never observes a connection present in one index and
//! missing from another. Every method is synchronous and never awaits while
//! holding the lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use livesync_shared::{Topic, UserId};
use serde::Serialize;
use uuid::Uuid;

use super::connection::Connection;
use crate::error::RegistryError;

struct Registration {
    conn: Arc<Connection>,
    topics: HashSet<Topic>,
}

#[derive(Default)]
struct RegistryIndex {
    connections: HashMap<Uuid, Registration>,
    by_user: HashMap<UserId, HashSet<Uuid>>,
    by_topic: HashMap<Topic, HashSet<Uuid>>,
}

impl RegistryIndex {
    fn resolve(&self, ids: Option<&HashSet<Uuid>>) -> Vec<Arc<Connection>> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .map(|registration| Arc::clone(&registration.conn))
            .collect()
    }

    fn unlink_topic(&mut self, topic: &Topic, id: &Uuid) {
        if let Some(members) = self.by_topic.get_mut(topic) {
            members.remove(id);
            if members.is_empty() {
                self.by_topic.remove(topic);
            }
        }
    }
}

/// Point-in-time registry size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub topics: usize,
}

/// Connection and subscription index shared by the gateway and router
#[derive(Default)]
pub struct SessionRegistry {
    index: RwLock<RegistryIndex>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection together with its initial topic set.
    ///
    /// Registering an id that is already present replaces its topics.
    pub fn register(&self, conn: Arc<Connection>, topics: impl IntoIterator<Item = Topic>) {
        let topics: HashSet<Topic> = topics.into_iter().collect();
        let id = conn.id;
        let user_id = conn.user_id().clone();

        let mut index = self.write();
        if let Some(previous) = index.connections.remove(&id) {
            for topic in &previous.topics {
                index.unlink_topic(topic, &id);
            }
        }

        for topic in &topics {
            index.by_topic.entry(topic.clone()).or_default().insert(id);
        }
        index.by_user.entry(user_id.clone()).or_default().insert(id);
        let topic_count = topics.len();
        index.connections.insert(id, Registration { conn, topics });

        tracing::info!(
            connection_id = %id,
            user_id = %user_id,
            topics = topic_count,
            total_connections = index.connections.len(),
            "Connection registered"
        );
    }

    /// Remove a connection and every subscription it holds.
    ///
    /// Idempotent: returns `None` when the connection is already gone.
    pub fn unregister(&self, id: &Uuid) -> Option<Arc<Connection>> {
        let mut index = self.write();
        let registration = index.connections.remove(id)?;

        for topic in &registration.topics {
            index.unlink_topic(topic, id);
        }

        let user_id = registration.conn.user_id();
        if let Some(sessions) = index.by_user.get_mut(user_id) {
            sessions.remove(id);
            if sessions.is_empty() {
                index.by_user.remove(user_id);
            }
        }

        tracing::info!(
            connection_id = %id,
            user_id = %user_id,
            remaining_connections = index.connections.len(),
            "Connection unregistered"
        );

        Some(registration.conn)
    }

    /// Add a topic to a live connection. Returns whether it was newly added.
    pub fn subscribe(&self, id: &Uuid, topic: Topic) -> Result<bool, RegistryError> {
        let mut index = self.write();
        let registration = index
            .connections
            .get_mut(id)
            .ok_or(RegistryError::UnknownConnection(*id))?;

        if !registration.topics.insert(topic.clone()) {
            return Ok(false);
        }
        index.by_topic.entry(topic.clone()).or_default().insert(*id);

        tracing::debug!(connection_id = %id, topic = %topic, "Subscribed to topic");
        Ok(true)
    }

    /// Remove a topic from a live connection. Returns whether it was present.
    pub fn unsubscribe(&self, id: &Uuid, topic: &Topic) -> Result<bool, RegistryError> {
        let mut index = self.write();
        let registration = index
            .connections
            .get_mut(id)
            .ok_or(RegistryError::UnknownConnection(*id))?;

        if !registration.topics.remove(topic) {
            return Ok(false);
        }
        index.unlink_topic(topic, id);

        tracing::debug!(connection_id = %id, topic = %topic, "Unsubscribed from topic");
        Ok(true)
    }

    /// Connections currently subscribed to `topic`
    pub fn lookup_by_topic(&self, topic: &Topic) -> Vec<Arc<Connection>> {
        let index = self.read();
        index.resolve(index.by_topic.get(topic))
    }

    /// Every live connection of a user
    pub fn lookup_by_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let index = self.read();
        index.resolve(index.by_user.get(user_id))
    }

    /// Subscribers of each topic, taken from one consistent snapshot.
    ///
    /// The result has one entry per input topic, in order; a connection
    /// subscribed to several of the topics appears in several entries.
    pub fn lookup_by_topics(&self, topics: &[Topic]) -> Vec<Vec<Arc<Connection>>> {
        let index = self.read();
        topics
            .iter()
            .map(|topic| index.resolve(index.by_topic.get(topic)))
            .collect()
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Connection>> {
        self.read()
            .connections
            .get(id)
            .map(|registration| Arc::clone(&registration.conn))
    }

    /// Topics a connection is subscribed to, sorted
    pub fn topics_of(&self, id: &Uuid) -> Option<BTreeSet<Topic>> {
        self.read()
            .connections
            .get(id)
            .map(|registration| registration.topics.iter().cloned().collect())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.read().connections.contains_key(id)
    }

    /// Get total number of registered connections
    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let index = self.read();
        RegistryStats {
            connections: index.connections.len(),
            users: index.by_user.len(),
            topics: index.by_topic.len(),
        }
    }
}
