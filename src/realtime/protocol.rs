//! WebSocket wire protocol
//!
//! JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present a credential (first frame when no `token` query was given)
    Auth {
        /// Signed JWT
        token: String,
    },
    /// Join a room
    Join {
        /// Room id
        room: String,
    },
    /// Leave a room
    Leave {
        /// Room id
        room: String,
    },
    /// Publish an event to a room
    Emit {
        /// Room id
        room: String,
        /// Event name
        event: String,
        /// Arbitrary payload
        #[serde(default)]
        data: Value,
    },
    /// Application-level keep-alive
    Ping,
}

/// Frames sent by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    Authenticated {
        /// Id assigned to this connection
        connection_id: String,
        /// Verified subject
        subject: String,
    },
    /// Room joined
    Joined {
        /// Room id
        room: String,
    },
    /// Room left
    Left {
        /// Room id
        room: String,
    },
    /// Event delivered from a room
    Event {
        /// Room id
        room: String,
        /// Event name
        event: String,
        /// Payload
        data: Value,
        /// Subject of the publisher, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    /// Reply to [`ClientMessage::Ping`]
    Pong,
    /// Request rejected
    Error {
        /// Stable code
        code: String,
        /// Human-readable message
        message: String,
    },
}

impl ServerMessage {
    /// Build an error frame
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Maximum room id length in bytes
pub const MAX_ROOM_LEN: usize = 128;

/// Check a room id: non-empty, bounded, no whitespace or control characters
///
/// # Errors
///
/// Returns a caller-safe description of the problem.
pub fn validate_room(room: &str) -> Result<(), String> {
    if room.is_empty() {
        return Err("room must not be empty".to_string());
    }
    if room.len() > MAX_ROOM_LEN {
        return Err(format!("room must be at most {MAX_ROOM_LEN} bytes"));
    }
    if room.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("room must not contain whitespace".to_string());
    }
    Ok(())
}
