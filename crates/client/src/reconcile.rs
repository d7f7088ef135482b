//! Upsert-by-id reconciliation
//!
//! A [`LiveCollection`] is the dashboard-side list for one entity collection.
//! Every message carries the full object (or the deleted id), so applying the
//! same message twice leaves the list unchanged; a REST refetch via
//! [`LiveCollection::replace_all`] restores whatever was missed while offline.

use livesync_shared::{Record, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Materials,
    Notices,
    Courses,
}

#[derive(Debug, Clone)]
pub struct LiveCollection {
    collection: Collection,
    /// Newest first
    items: Vec<Record>,
}

impl LiveCollection {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            items: Vec::new(),
        }
    }

    pub fn materials() -> Self {
        Self::new(Collection::Materials)
    }

    pub fn notices() -> Self {
        Self::new(Collection::Notices)
    }

    pub fn courses() -> Self {
        Self::new(Collection::Courses)
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Apply a server message. Messages for other collections are ignored.
    ///
    /// Returns whether the list changed.
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        use ServerMessage::*;

        match (self.collection, message) {
            (
                Collection::Materials,
                MaterialUploaded { material } | MaterialUpdated { material } | MaterialStatsUpdated { material },
            ) => self.upsert(material.clone()),
            (Collection::Materials, MaterialDeleted { material_id }) => self.remove(material_id),
            (Collection::Notices, NewNotice { notice } | NoticeUpdated { notice }) => {
                self.upsert(notice.clone())
            }
            (Collection::Notices, NoticeDeleted { notice_id }) => self.remove(notice_id),
            (Collection::Courses, CourseLaunched { course }) => self.upsert(course.clone()),
            _ => false,
        }
    }

    /// Replace the record with the same id in place, or add it to the front
    pub fn upsert(&mut self, record: Record) -> bool {
        match self.items.iter_mut().find(|item| item.id == record.id) {
            Some(existing) if *existing == record => false,
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.items.insert(0, record);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    /// Replace the whole list with a fresh REST snapshot.
    ///
    /// Snapshot order is kept; a repeated id keeps its last occurrence.
    pub fn replace_all(&mut self, records: impl IntoIterator<Item = Record>) {
        let mut items: Vec<Record> = Vec::new();
        for record in records {
            match items.iter_mut().find(|item| item.id == record.id) {
                Some(existing) => *existing = record,
                None => items.push(record),
            }
        }
        self.items = items;
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn items(&self) -> &[Record] {
        &self.items
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
