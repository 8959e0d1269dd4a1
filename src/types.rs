//! Wire-level data model and inbound validation.
//!
//! Three shapes cross process boundaries and one lands in storage:
//!
//! - [`ChatMessage`]: what clients send over the socket (validated here).
//! - [`QueuedMessage`]: what crosses the broker: the chat message plus the
//!   routing room and the server ingress timestamp.
//! - [`BroadcastMessage`]: what crosses the bus: denormalized for delivery,
//!   never stored.
//! - The stored row is built by the DB writer at insert time (fresh id per
//!   row) and lives in `storage`.
//!
//! All JSON field names are camelCase to match the client protocol.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// LIMITS
// =============================================================================

/// Inclusive userId range accepted from clients.
/// userId is self-asserted; the range bound is a sanity limit, not auth.
pub const USER_ID_MIN: i64 = 1;
pub const USER_ID_MAX: i64 = 100_000;

/// Username length bounds (ASCII alphanumeric only).
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 20;

/// Message body length bounds, counted in characters.
pub const MESSAGE_MIN_LEN: usize = 1;
pub const MESSAGE_MAX_LEN: usize = 500;

/// Inclusive room range. Every room has exactly one broker queue and one
/// bus channel; the bound keeps topology declaration finite.
pub const ROOM_MIN: u32 = 1;
pub const ROOM_MAX: u32 = 20;

/// Logical room identifier, always within [`ROOM_MIN`]..=[`ROOM_MAX`].
pub type RoomId = u32;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as an ISO-8601 UTC string (millisecond precision).
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Pattern covering every room channel on the bus.
pub const BUS_PATTERN: &str = "chatroom:*";

/// Bus channel carrying a room's broadcasts.
pub fn bus_channel(room: RoomId) -> String {
    format!("chatroom:{}", room)
}

/// Extract the room id from a bus channel name, rejecting anything outside
/// the room range.
pub fn room_from_bus_channel(channel: &str) -> Option<RoomId> {
    let room: RoomId = channel.strip_prefix("chatroom:")?.parse().ok()?;
    (ROOM_MIN..=ROOM_MAX).contains(&room).then_some(room)
}

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Join,
    Leave,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "TEXT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
        }
    }
}

/// A fully validated client message.
///
/// `timestamp` is the client-asserted ISO-8601 string, kept verbatim after
/// parse-checking so the ack and broadcast echo exactly what was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_id: u32,
    pub username: String,
    pub message: String,
    pub timestamp: String,
    pub message_type: MessageType,
    pub room_id: RoomId,
}

/// Raw inbound frame shape.
///
/// Deserialized before validation so each rule can fail with its own
/// distinct error string. A frame that does not even bind to this shape
/// (bad JSON, missing field, wrong primitive type) is a parse error, not a
/// validation error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChatMessage {
    pub user_id: i64,
    pub username: String,
    pub message: String,
    pub timestamp: String,
    pub message_type: String,
    pub room_id: i64,
}

/// One variant per validation rule. The Display string is what the client
/// sees in the VALIDATION_ERROR envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("userId must be between {USER_ID_MIN} and {USER_ID_MAX}, got {0}")]
    UserId(i64),
    #[error("username must be 3-20 ASCII alphanumeric characters")]
    Username,
    #[error("message must be 1-500 characters, got {0}")]
    MessageLength(usize),
    #[error("timestamp is not a valid ISO-8601 datetime: {0}")]
    Timestamp(String),
    #[error("messageType must be one of TEXT, JOIN, LEAVE, got {0}")]
    MessageType(String),
    #[error("roomId must be between {ROOM_MIN} and {ROOM_MAX}, got {0}")]
    RoomId(i64),
}

impl RawChatMessage {
    /// Apply the full rule set in a fixed order, first failure wins.
    pub fn validate(self) -> Result<ChatMessage, ValidationError> {
        if !(USER_ID_MIN..=USER_ID_MAX).contains(&self.user_id) {
            return Err(ValidationError::UserId(self.user_id));
        }
        let name_len = self.username.len();
        if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&name_len)
            || !self.username.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ValidationError::Username);
        }
        let msg_len = self.message.chars().count();
        if !(MESSAGE_MIN_LEN..=MESSAGE_MAX_LEN).contains(&msg_len) {
            return Err(ValidationError::MessageLength(msg_len));
        }
        if DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(ValidationError::Timestamp(self.timestamp));
        }
        let message_type = match self.message_type.as_str() {
            "TEXT" => MessageType::Text,
            "JOIN" => MessageType::Join,
            "LEAVE" => MessageType::Leave,
            other => return Err(ValidationError::MessageType(other.to_string())),
        };
        if !(ROOM_MIN as i64..=ROOM_MAX as i64).contains(&self.room_id) {
            return Err(ValidationError::RoomId(self.room_id));
        }
        Ok(ChatMessage {
            user_id: self.user_id as u32,
            username: self.username,
            message: self.message,
            timestamp: self.timestamp,
            message_type,
            room_id: self.room_id as RoomId,
        })
    }
}

/// What crosses the broker: the validated message plus the routing room
/// (duplicated so consumers never depend on the nested payload for
/// partitioning) and the server ingress timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message: ChatMessage,
    pub room_id: RoomId,
    pub received_timestamp: i64,
}

impl QueuedMessage {
    pub fn new(message: ChatMessage) -> Self {
        let room_id = message.room_id;
        Self {
            message,
            room_id,
            received_timestamp: now_millis(),
        }
    }
}

/// What crosses the bus: denormalized for fast delivery, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub user_id: u32,
    pub username: String,
    pub message: String,
    pub message_type: MessageType,
    pub room_id: RoomId,
    pub client_timestamp: String,
    pub server_timestamp: i64,
}

impl BroadcastMessage {
    /// Denormalize a queued message, stamping the processing time.
    pub fn from_queued(queued: &QueuedMessage) -> Self {
        Self {
            user_id: queued.message.user_id,
            username: queued.message.username.clone(),
            message: queued.message.message.clone(),
            message_type: queued.message.message_type,
            room_id: queued.room_id,
            client_timestamp: queued.message.timestamp.clone(),
            server_timestamp: now_millis(),
        }
    }
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// Sent back on the socket iff the broker accepted the publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub user_id: u32,
    pub username: String,
    pub message: String,
    pub client_timestamp: String,
    pub message_type: MessageType,
    pub status: String,
    pub server_timestamp: i64,
}

impl AckResponse {
    pub fn accepted(msg: &ChatMessage) -> Self {
        Self {
            user_id: msg.user_id,
            username: msg.username.clone(),
            message: msg.message.clone(),
            client_timestamp: msg.timestamp.clone(),
            message_type: msg.message_type,
            status: "OK".to_string(),
            server_timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "PARSE_ERROR")]
    Parse,
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "QUEUE_ERROR")]
    Queue,
}

/// Sent back on the socket for any rejected frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            timestamp: iso_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(user_id: i64, username: &str, message: &str, timestamp: &str, mt: &str, room: i64) -> RawChatMessage {
        RawChatMessage {
            user_id,
            username: username.to_string(),
            message: message.to_string(),
            timestamp: timestamp.to_string(),
            message_type: mt.to_string(),
            room_id: room,
        }
    }

    fn valid_raw() -> RawChatMessage {
        raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 7)
    }

    #[test]
    fn accepts_valid_message() {
        let msg = valid_raw().validate().unwrap();
        assert_eq!(msg.user_id, 1);
        assert_eq!(msg.room_id, 7);
        assert_eq!(msg.message_type, MessageType::Text);
    }

    #[test]
    fn username_length_boundaries() {
        assert_eq!(
            raw(1, "ab", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate(),
            Err(ValidationError::Username)
        );
        assert!(raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_ok());
        assert!(raw(1, &"a".repeat(20), "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_ok());
        assert_eq!(
            raw(1, &"a".repeat(21), "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate(),
            Err(ValidationError::Username)
        );
    }

    #[test]
    fn username_rejects_non_alphanumeric() {
        assert_eq!(
            raw(1, "ab_c", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate(),
            Err(ValidationError::Username)
        );
    }

    #[test]
    fn message_length_boundaries() {
        assert_eq!(
            raw(1, "abc", "", "2025-01-01T00:00:00Z", "TEXT", 1).validate(),
            Err(ValidationError::MessageLength(0))
        );
        assert!(raw(1, "abc", "x", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_ok());
        assert!(raw(1, "abc", &"x".repeat(500), "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_ok());
        assert_eq!(
            raw(1, "abc", &"x".repeat(501), "2025-01-01T00:00:00Z", "TEXT", 1).validate(),
            Err(ValidationError::MessageLength(501))
        );
    }

    #[test]
    fn user_id_boundaries() {
        assert!(raw(0, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_err());
        assert!(raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_ok());
        assert!(raw(100_000, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_ok());
        assert!(raw(100_001, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 1).validate().is_err());
    }

    #[test]
    fn room_id_boundaries() {
        assert_eq!(
            raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 0).validate(),
            Err(ValidationError::RoomId(0))
        );
        assert!(raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 20).validate().is_ok());
        assert_eq!(
            raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "TEXT", 21).validate(),
            Err(ValidationError::RoomId(21))
        );
    }

    #[test]
    fn timestamp_must_parse() {
        let err = raw(1, "abc", "hi", "not-a-date", "TEXT", 1).validate().unwrap_err();
        assert!(matches!(err, ValidationError::Timestamp(_)));
    }

    #[test]
    fn message_type_must_be_known() {
        let err = raw(1, "abc", "hi", "2025-01-01T00:00:00Z", "SHOUT", 1).validate().unwrap_err();
        assert_eq!(err, ValidationError::MessageType("SHOUT".to_string()));
        assert_eq!(err.to_string(), "messageType must be one of TEXT, JOIN, LEAVE, got SHOUT");
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let msg = valid_raw().validate().unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("messageType").is_some());
        assert_eq!(json["messageType"], "TEXT");

        let queued = QueuedMessage::new(msg);
        let json = serde_json::to_value(&queued).unwrap();
        assert_eq!(json["roomId"], 7);
        assert!(json.get("receivedTimestamp").is_some());
        assert_eq!(json["message"]["roomId"], 7);
    }

    #[test]
    fn error_kind_wire_names() {
        let resp = ErrorResponse::new(ErrorKind::Parse, "bad json");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["error"], "PARSE_ERROR");
        assert_eq!(
            serde_json::to_value(ErrorKind::Validation).unwrap(),
            "VALIDATION_ERROR"
        );
        assert_eq!(serde_json::to_value(ErrorKind::Queue).unwrap(), "QUEUE_ERROR");
    }

    #[test]
    fn broadcast_denormalizes_queued() {
        let queued = QueuedMessage::new(valid_raw().validate().unwrap());
        let b = BroadcastMessage::from_queued(&queued);
        assert_eq!(b.room_id, 7);
        assert_eq!(b.client_timestamp, "2025-01-01T00:00:00Z");
        assert!(b.server_timestamp >= queued.received_timestamp);
        let json = serde_json::to_value(&b).unwrap();
        assert!(json.get("serverTimestamp").is_some());
    }

    #[test]
    fn bus_channel_round_trip() {
        assert_eq!(bus_channel(7), "chatroom:7");
        assert_eq!(room_from_bus_channel("chatroom:7"), Some(7));
        assert_eq!(room_from_bus_channel("chatroom:20"), Some(20));
        assert_eq!(room_from_bus_channel("chatroom:0"), None);
        assert_eq!(room_from_bus_channel("chatroom:21"), None);
        assert_eq!(room_from_bus_channel("chatroom:abc"), None);
        assert_eq!(room_from_bus_channel("other:7"), None);
    }

    #[test]
    fn ack_echoes_message_fields() {
        let msg = valid_raw().validate().unwrap();
        let ack = AckResponse::accepted(&msg);
        assert_eq!(ack.status, "OK");
        assert_eq!(ack.user_id, msg.user_id);
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "OK");
        assert!(json.get("clientTimestamp").is_some());
    }
}
