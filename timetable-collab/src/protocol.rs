//! Wire protocol for both real-time channels.
//!
//! CRDT channel (`/sync/{document}`), binary frames, bincode-encoded:
//! ```text
//! ┌───────────┬──────────────────────────────────────────┐
//! │ variant   │ payload                                  │
//! │ varint    │ length-prefixed bytes (absent for Ping)  │
//! └───────────┴──────────────────────────────────────────┘
//! ```
//!
//! Presence channel (`/presence`), JSON text frames tagged by `type`:
//! ```text
//! → {"type":"join","scheduleId":"schedule-cs-100-fall","clientId":"c1",
//!    "user":{"userId":"u1","userName":"Ada"}}
//! → {"type":"awareness","activeCell":"R3C2"}
//! → {"type":"cellUpdate","cellId":"R3C2","cellData":{...}}
//! → {"type":"leave"} / {"type":"ping"}
//! ← {"type":"awareness","users":[...]} / {"type":"userLeft","clientId":4294967296}
//! ← {"type":"cellUpdate",...} / {"type":"pong"}
//! ```

use serde::{Deserialize, Serialize};

use crate::awareness::{ClientId, PresenceRecord};

/// Message kinds on the CRDT channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// State vector request
    SyncStep1 = 0,
    /// Diff answering a step 1
    SyncStep2 = 1,
    /// Incremental CRDT update
    Update = 2,
    /// Presence changes
    Awareness = 3,
    Ping = 4,
    Pong = 5,
}

/// Binary message on the CRDT channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Encoded Yrs state vector.
    SyncStep1(Vec<u8>),
    /// Encoded Yrs update answering a step 1.
    SyncStep2(Vec<u8>),
    /// Encoded Yrs update produced by a local edit.
    Update(Vec<u8>),
    /// Encoded [`AwarenessUpdate`](crate::awareness::AwarenessUpdate).
    Awareness(Vec<u8>),
    Ping,
    Pong,
}

impl SyncMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::SyncStep1(_) => MessageType::SyncStep1,
            Self::SyncStep2(_) => MessageType::SyncStep2,
            Self::Update(_) => MessageType::Update,
            Self::Awareness(_) => MessageType::Awareness,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Unknown variants and trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Deserialization(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }
}

/// Authenticated identity carried by a presence `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub user_name: String,
}

/// Inbound JSON message on the presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresenceMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        schedule_id: String,
        #[serde(default)]
        client_id: Option<String>,
        user: UserInfo,
    },
    #[serde(rename_all = "camelCase")]
    Awareness {
        #[serde(default)]
        active_cell: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CellUpdate {
        cell_id: String,
        cell_data: serde_json::Value,
    },
    Leave,
    Ping,
}

impl PresenceMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// One row of the active-user list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub client_id: ClientId,
    pub user_id: String,
    pub user_name: String,
    pub active_cell: Option<String>,
}

impl PresenceUser {
    pub fn from_record(client_id: ClientId, record: PresenceRecord) -> Self {
        Self {
            client_id,
            user_id: record.user_id,
            user_name: record.user_name,
            active_cell: record.active_cell,
        }
    }
}

/// Outbound JSON message on the presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresenceEvent {
    /// Full active-user list of the room.
    Awareness { users: Vec<PresenceUser> },
    #[serde(rename_all = "camelCase")]
    CellUpdate {
        client_id: ClientId,
        cell_id: String,
        cell_data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { client_id: ClientId },
    Pong,
}

impl PresenceEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A frame queued for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Sync(SyncMessage),
    Presence(PresenceEvent),
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("{0} is not valid on this channel")]
    WrongChannel(&'static str),
    #[error("connection has not joined a schedule")]
    NotJoined,
    #[error("client {client_id} is owned by another connection")]
    ForeignClient { client_id: ClientId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_message_roundtrip() {
        let msg = SyncMessage::Update(vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), MessageType::Update);
    }

    #[test]
    fn test_ping_is_tiny() {
        let bytes = SyncMessage::Ping.encode().unwrap();
        assert_eq!(bytes.len(), 1);
        assert_eq!(SyncMessage::decode(&bytes).unwrap(), SyncMessage::Ping);
    }

    #[test]
    fn test_unknown_variant_rejected() {
        assert!(SyncMessage::decode(&[42]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = SyncMessage::Pong.encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            SyncMessage::decode(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_decode_empty() {
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 0);
        assert_eq!(MessageType::SyncStep2 as u8, 1);
        assert_eq!(MessageType::Update as u8, 2);
        assert_eq!(MessageType::Awareness as u8, 3);
        assert_eq!(SyncMessage::SyncStep1(vec![]).kind() as u8, 0);
        assert_eq!(SyncMessage::Awareness(vec![]).kind() as u8, 3);
    }

    #[test]
    fn test_large_update() {
        let msg = SyncMessage::SyncStep2(vec![42u8; 65536]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_presence_join_decode() {
        let text = r#"{"type":"join","scheduleId":"schedule-cs-100-fall","clientId":"c1","user":{"userId":"u1","userName":"Ada"}}"#;
        match PresenceMessage::decode(text).unwrap() {
            PresenceMessage::Join {
                schedule_id,
                client_id,
                user,
            } => {
                assert_eq!(schedule_id, "schedule-cs-100-fall");
                assert_eq!(client_id.as_deref(), Some("c1"));
                assert_eq!(user.user_name, "Ada");
            }
            other => panic!("Expected Join, got {other:?}"),
        }
    }

    #[test]
    fn test_presence_awareness_null_cell() {
        let msg = PresenceMessage::decode(r#"{"type":"awareness","activeCell":null}"#).unwrap();
        assert_eq!(msg, PresenceMessage::Awareness { active_cell: None });
        let msg = PresenceMessage::decode(r#"{"type":"awareness"}"#).unwrap();
        assert_eq!(msg, PresenceMessage::Awareness { active_cell: None });
    }

    #[test]
    fn test_presence_cell_update_keeps_payload() {
        let text = r#"{"type":"cellUpdate","cellId":"R1C1","cellData":{"course":"CS101","room":12}}"#;
        match PresenceMessage::decode(text).unwrap() {
            PresenceMessage::CellUpdate { cell_id, cell_data } => {
                assert_eq!(cell_id, "R1C1");
                assert_eq!(cell_data["course"], "CS101");
                assert_eq!(cell_data["room"], 12);
            }
            other => panic!("Expected CellUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_presence_unknown_type() {
        assert!(PresenceMessage::decode(r#"{"type":"teleport"}"#).is_err());
        assert!(PresenceMessage::decode("not json").is_err());
    }

    #[test]
    fn test_presence_event_shape() {
        let event = PresenceEvent::Awareness {
            users: vec![PresenceUser::from_record(
                7,
                PresenceRecord::new("u1", "Ada").with_active_cell("R3C2"),
            )],
        };
        let json: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "awareness");
        assert_eq!(json["users"][0]["clientId"], 7);
        assert_eq!(json["users"][0]["userName"], "Ada");
        assert_eq!(json["users"][0]["activeCell"], "R3C2");

        let left = PresenceEvent::UserLeft { client_id: 7 }.encode().unwrap();
        assert_eq!(left, r#"{"type":"userLeft","clientId":7}"#);
        assert_eq!(PresenceEvent::Pong.encode().unwrap(), r#"{"type":"pong"}"#);
    }
}
