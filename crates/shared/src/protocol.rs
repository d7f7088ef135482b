//! Wire protocol for the live sync channel
//!
//! Frames are JSON text messages over a WebSocket.
//!
//! - Client → server: control frames, `{"action": "subscribe", "topic": "materials"}`
//! - Server → client: event frames, `{"type": "...", "timestamp": 1700000000000, ...fields}`
//!
//! Server frames are decoded exactly once, at the client boundary, into the
//! [`ServerMessage`] tagged union. Frames whose `type` is not part of this
//! catalog decode to `None` so that older clients keep working when the server
//! grows new event kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::ProtocolError;
use crate::topic::Topic;
use crate::types::{Course, EventId, EventKind, Material, Notice, Record, UserId};

// =============================================================================
// Client-to-Server Frames
// =============================================================================

/// Control frames sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Add an explicit subscription
    Subscribe { topic: Topic },

    /// Remove an explicit subscription
    Unsubscribe { topic: Topic },

    /// Application-level heartbeat, answered with `pong`
    Ping,
}

#[derive(Deserialize)]
struct RawClientFrame {
    action: String,
    #[serde(default)]
    topic: Option<String>,
}

impl ClientFrame {
    /// Decode a control frame, validating the topic
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawClientFrame = serde_json::from_str(text)?;
        match raw.action.as_str() {
            "subscribe" => Ok(ClientFrame::Subscribe {
                topic: required_topic(raw.topic)?,
            }),
            "unsubscribe" => Ok(ClientFrame::Unsubscribe {
                topic: required_topic(raw.topic)?,
            }),
            "ping" => Ok(ClientFrame::Ping),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn required_topic(topic: Option<String>) -> Result<Topic, ProtocolError> {
    let topic = topic.ok_or_else(|| ProtocolError::Malformed("missing topic".to_string()))?;
    Topic::new(topic)
}

// =============================================================================
// Server-to-Client Messages
// =============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted; always the first frame on a connection
    Authenticated {
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    /// Rejected control frame or pre-open traffic
    Error { message: String },

    /// Answer to a `ping` control frame
    Pong,

    MaterialUploaded { material: Material },

    MaterialUpdated { material: Material },

    MaterialDeleted {
        #[serde(rename = "materialId")]
        material_id: String,
    },

    /// Rating or download counters changed
    MaterialStatsUpdated { material: Material },

    NewNotice { notice: Notice },

    NoticeUpdated { notice: Notice },

    NoticeDeleted {
        #[serde(rename = "noticeId")]
        notice_id: String,
    },

    CourseLaunched { course: Course },
}

impl ServerMessage {
    /// Build a catalog message from an event kind and its raw payload.
    ///
    /// Entity kinds take the persisted object; deletion kinds take either the
    /// deleted id or an object carrying it.
    pub fn from_event(kind: EventKind, payload: Value) -> Result<Self, ProtocolError> {
        let message = match kind {
            EventKind::MaterialUploaded => ServerMessage::MaterialUploaded {
                material: record(payload)?,
            },
            EventKind::MaterialUpdated => ServerMessage::MaterialUpdated {
                material: record(payload)?,
            },
            EventKind::MaterialStatsUpdated => ServerMessage::MaterialStatsUpdated {
                material: record(payload)?,
            },
            EventKind::MaterialDeleted => ServerMessage::MaterialDeleted {
                material_id: deleted_id(payload)?,
            },
            EventKind::NewNotice => ServerMessage::NewNotice {
                notice: record(payload)?,
            },
            EventKind::NoticeUpdated => ServerMessage::NoticeUpdated {
                notice: record(payload)?,
            },
            EventKind::NoticeDeleted => ServerMessage::NoticeDeleted {
                notice_id: deleted_id(payload)?,
            },
            EventKind::CourseLaunched => ServerMessage::CourseLaunched {
                course: record(payload)?,
            },
        };
        Ok(message)
    }

    /// Catalog kind, or `None` for protocol messages
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            ServerMessage::Authenticated { .. } | ServerMessage::Error { .. } | ServerMessage::Pong => {
                None
            }
            ServerMessage::MaterialUploaded { .. } => Some(EventKind::MaterialUploaded),
            ServerMessage::MaterialUpdated { .. } => Some(EventKind::MaterialUpdated),
            ServerMessage::MaterialDeleted { .. } => Some(EventKind::MaterialDeleted),
            ServerMessage::MaterialStatsUpdated { .. } => Some(EventKind::MaterialStatsUpdated),
            ServerMessage::NewNotice { .. } => Some(EventKind::NewNotice),
            ServerMessage::NoticeUpdated { .. } => Some(EventKind::NoticeUpdated),
            ServerMessage::NoticeDeleted { .. } => Some(EventKind::NoticeDeleted),
            ServerMessage::CourseLaunched { .. } => Some(EventKind::CourseLaunched),
        }
    }

    /// Wire name of the `type` field
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Authenticated { .. } => "authenticated",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong => "pong",
            other => other.kind().map(|kind| kind.as_str()).unwrap_or("unknown"),
        }
    }
}

fn record(payload: Value) -> Result<Record, ProtocolError> {
    if !payload.is_object() {
        return Err(ProtocolError::Malformed(
            "payload must be the persisted object".to_string(),
        ));
    }
    Ok(serde_json::from_value(payload)?)
}

fn deleted_id(payload: Value) -> Result<String, ProtocolError> {
    match payload {
        Value::String(id) if !id.is_empty() => Ok(id),
        Value::Object(_) => Ok(record(payload)?.id),
        _ => Err(ProtocolError::Malformed(
            "payload must be the deleted id or an object with an id".to_string(),
        )),
    }
}

fn is_known_type(name: &str) -> bool {
    matches!(name, "authenticated" | "error" | "pong") || name.parse::<EventKind>().is_ok()
}

// =============================================================================
// Server Frame
// =============================================================================

/// A server message stamped with its send timestamp and, for catalog events,
/// the event id.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrame {
    pub event_id: Option<EventId>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub message: ServerMessage,
}

impl ServerFrame {
    /// Frame a protocol message stamped with the current time
    pub fn now(message: ServerMessage) -> Self {
        Self {
            event_id: None,
            timestamp: now_millis(),
            message,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.message)?;
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_string(), Value::from(self.timestamp));
            if let Some(event_id) = self.event_id {
                map.insert("eventId".to_string(), Value::from(event_id));
            }
        }
        serde_json::to_string(&value)
    }

    /// Decode a server frame.
    ///
    /// Returns `Ok(None)` for well-formed frames of a type this build does not
    /// know about; those must be ignored rather than treated as errors.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        let mut value: Value = serde_json::from_str(text)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| ProtocolError::Malformed("frame must be a JSON object".to_string()))?;

        let known = match map.get("type").and_then(Value::as_str) {
            Some(name) => is_known_type(name),
            None => return Err(ProtocolError::Malformed("missing type".to_string())),
        };
        if !known {
            return Ok(None);
        }

        let timestamp = map
            .remove("timestamp")
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        let event_id = map.remove("eventId").and_then(|v| v.as_u64());
        let message = serde_json::from_value(value)?;

        Ok(Some(Self {
            event_id,
            timestamp,
            message,
        }))
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    millis(OffsetDateTime::now_utc())
}

pub fn millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_decoding() {
        let frame = ClientFrame::decode(r#"{"action":"subscribe","topic":"materials"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                topic: Topic::new("materials").unwrap()
            }
        );
        assert_eq!(ClientFrame::decode(r#"{"action":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn test_client_frame_errors() {
        assert!(matches!(
            ClientFrame::decode(r#"{"action":"publish","topic":"x"}"#),
            Err(ProtocolError::UnknownAction(action)) if action == "publish"
        ));
        assert!(matches!(
            ClientFrame::decode(r#"{"action":"subscribe"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientFrame::decode(r#"{"action":"subscribe","topic":"a b"}"#),
            Err(ProtocolError::InvalidTopic(_))
        ));
        assert!(matches!(ClientFrame::decode("not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_client_frame_encoding() {
        let frame = ClientFrame::Unsubscribe {
            topic: Topic::new("notices").unwrap(),
        };
        assert_eq!(frame.encode().unwrap(), r#"{"action":"unsubscribe","topic":"notices"}"#);
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let frame = ServerFrame {
            event_id: Some(7),
            timestamp: 1_700_000_000_000,
            message: ServerMessage::MaterialDeleted {
                material_id: "m-1".to_string(),
            },
        };
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "material_deleted",
                "materialId": "m-1",
                "timestamp": 1_700_000_000_000i64,
                "eventId": 7
            })
        );
    }

    #[test]
    fn test_authenticated_frame_has_no_event_id() {
        let frame = ServerFrame::now(ServerMessage::Authenticated {
            user_id: UserId::from("u-1"),
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "authenticated");
        assert_eq!(value["userId"], "u-1");
        assert!(value.get("eventId").is_none());
    }

    #[test]
    fn test_decode_event_frame() {
        let text = r#"{"type":"new_notice","timestamp":5,"eventId":3,"notice":{"_id":"n-1","title":"Exam"}}"#;
        let frame = ServerFrame::decode(text).unwrap().unwrap();
        assert_eq!(frame.event_id, Some(3));
        assert_eq!(frame.timestamp, 5);
        match frame.message {
            ServerMessage::NewNotice { notice } => {
                assert_eq!(notice.id, "n-1");
                assert_eq!(notice.get("title"), Some(&json!("Exam")));
            }
            other => panic!("Expected NewNotice, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_ignores_unknown_type() {
        let text = r#"{"type":"subject_archived","timestamp":1,"subject":{}}"#;
        assert!(ServerFrame::decode(text).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_known_type() {
        let text = r#"{"type":"material_uploaded","timestamp":1}"#;
        assert!(ServerFrame::decode(text).is_err());
        assert!(ServerFrame::decode("[1,2]").is_err());
        assert!(ServerFrame::decode(r#"{"timestamp":1}"#).is_err());
    }

    #[test]
    fn test_from_event_payload_validation() {
        let uploaded =
            ServerMessage::from_event(EventKind::MaterialUploaded, json!({"id": "m-9"})).unwrap();
        assert_eq!(uploaded.kind(), Some(EventKind::MaterialUploaded));

        let deleted =
            ServerMessage::from_event(EventKind::NoticeDeleted, json!("n-4")).unwrap();
        assert_eq!(
            deleted,
            ServerMessage::NoticeDeleted {
                notice_id: "n-4".to_string()
            }
        );

        let deleted_obj =
            ServerMessage::from_event(EventKind::MaterialDeleted, json!({"_id": "m-2"})).unwrap();
        assert_eq!(
            deleted_obj,
            ServerMessage::MaterialDeleted {
                material_id: "m-2".to_string()
            }
        );

        assert!(ServerMessage::from_event(EventKind::CourseLaunched, json!("c-1")).is_err());
        assert!(ServerMessage::from_event(EventKind::NoticeDeleted, json!(42)).is_err());
    }

    #[test]
    fn test_type_names_match_serialization() {
        let messages = vec![
            ServerMessage::Pong,
            ServerMessage::Error {
                message: "nope".to_string(),
            },
            ServerMessage::CourseLaunched {
                course: Record::new("c-1"),
            },
        ];
        for message in messages {
            let value = serde_json::to_value(&message).unwrap();
            assert_eq!(value["type"], message.type_name());
        }
    }
}
