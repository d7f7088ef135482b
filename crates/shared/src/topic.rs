//! Topic addressing
//!
//! Topics are opaque strings used to address a subset of connections. The
//! identity-scoped families are derived from the authenticated identity at
//! handshake time; everything else (`materials`, `notices`, ...) is opted into
//! by explicit subscribe frames.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{Identity, UserId};

/// Maximum topic length in bytes
pub const MAX_TOPIC_LEN: usize = 128;

/// Implicit topic every connection is subscribed to
pub const BROADCAST: &str = "broadcast";

const USER_PREFIX: &str = "user:";
const ROLE_PREFIX: &str = "role:";
const BRANCH_PREFIX: &str = "branch:";
const SEMESTER_PREFIX: &str = "semester:";

/// A validated topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Validate and wrap a topic name
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidTopic("topic must not be empty".to_string()));
        }
        if name.len() > MAX_TOPIC_LEN {
            return Err(ProtocolError::InvalidTopic(format!(
                "topic exceeds {MAX_TOPIC_LEN} bytes"
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProtocolError::InvalidTopic(
                "topic must not contain whitespace or control characters".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn broadcast() -> Self {
        Self(BROADCAST.to_string())
    }

    pub fn user(user_id: &UserId) -> Self {
        Self(format!("{USER_PREFIX}{user_id}"))
    }

    pub fn role(role: &str) -> Self {
        Self(format!("{ROLE_PREFIX}{role}"))
    }

    pub fn branch(branch: &str) -> Self {
        Self(format!("{BRANCH_PREFIX}{branch}"))
    }

    pub fn semester(branch: &str, semester: u8) -> Self {
        Self(format!("{SEMESTER_PREFIX}{branch}:{semester}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this topic belongs to a family derived from identities
    pub fn is_identity_scoped(&self) -> bool {
        [USER_PREFIX, ROLE_PREFIX, BRANCH_PREFIX, SEMESTER_PREFIX]
            .iter()
            .any(|prefix| self.0.starts_with(prefix))
    }

    /// Default topic set for an authenticated identity
    pub fn defaults_for(identity: &Identity) -> BTreeSet<Topic> {
        let mut topics = BTreeSet::new();
        topics.insert(Topic::broadcast());
        topics.insert(Topic::user(&identity.user_id));
        topics.insert(Topic::role(&identity.role));
        if let Some(branch) = identity.branch.as_deref() {
            topics.insert(Topic::branch(branch));
            if let Some(semester) = identity.semester {
                topics.insert(Topic::semester(branch, semester));
            }
        }
        topics
    }

    /// Whether `identity` may explicitly subscribe to this topic.
    ///
    /// Identity-scoped topics are only open to the identity they derive from;
    /// all other topics are open to every authenticated connection.
    pub fn permits(&self, identity: &Identity) -> bool {
        !self.is_identity_scoped() || Topic::defaults_for(identity).contains(self)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::new(s)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Topic::new(name).map_err(serde::de::Error::custom)
    }
}
