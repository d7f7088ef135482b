//! Common types used across the live sync broker and its clients

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// ID Wrappers
// =============================================================================

/// Portal user ID wrapper
///
/// User ids are issued by the portal's identity service and are opaque to the
/// broker, so they are carried as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Monotonic event id, unique within one broker process
pub type EventId = u64;

// =============================================================================
// Identity
// =============================================================================

/// Authenticated identity returned by the identity verifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub role: String,
    /// Academic branch; staff and admin identities have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semester: Option<u8>,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            branch: None,
            semester: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_semester(mut self, semester: u8) -> Self {
        self.semester = Some(semester);
        self
    }
}

// =============================================================================
// Entity Records
// =============================================================================

/// A portal entity (material, notice, course) as persisted by the REST layer.
///
/// Only the id is interpreted; every other field is carried through verbatim so
/// the broker never has to track the portal's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

pub type Material = Record;
pub type Notice = Record;
pub type Course = Record;

// =============================================================================
// Event Catalog
// =============================================================================

/// State-changing event kinds pushed to dashboards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MaterialUploaded,
    MaterialUpdated,
    MaterialDeleted,
    MaterialStatsUpdated,
    NewNotice,
    NoticeUpdated,
    NoticeDeleted,
    CourseLaunched,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::MaterialUploaded,
        EventKind::MaterialUpdated,
        EventKind::MaterialDeleted,
        EventKind::MaterialStatsUpdated,
        EventKind::NewNotice,
        EventKind::NoticeUpdated,
        EventKind::NoticeDeleted,
        EventKind::CourseLaunched,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MaterialUploaded => "material_uploaded",
            EventKind::MaterialUpdated => "material_updated",
            EventKind::MaterialDeleted => "material_deleted",
            EventKind::MaterialStatsUpdated => "material_stats_updated",
            EventKind::NewNotice => "new_notice",
            EventKind::NoticeUpdated => "notice_updated",
            EventKind::NoticeDeleted => "notice_deleted",
            EventKind::CourseLaunched => "course_launched",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event type: {0}")]
pub struct UnknownEventKind(pub String);
