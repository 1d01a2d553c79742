use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the room-scoped presence event (`{ roomId, status }` payload).
pub const PRESENCE_EVENT: &str = "presence";

/// Query parameter carrying the bearer credential on the connection URL.
pub const TOKEN_PARAM: &str = "token";

/// Maximum accepted room ID length, in characters.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Frames sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Ask for delivery of events scoped to a room
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },

    /// Stop delivery of events scoped to a room
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },

    /// Ping to check connection
    Ping,
}

impl ClientFrame {
    pub fn join(room_id: &str) -> Self {
        ClientFrame::JoinRoom {
            room_id: room_id.to_string(),
        }
    }

    pub fn leave(room_id: &str) -> Self {
        ClientFrame::LeaveRoom {
            room_id: room_id.to_string(),
        }
    }
}

/// Frames sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// First frame on every accepted connection, carrying the identity the
    /// server assigned to it.
    Welcome { sid: String },

    /// An application event.
    ///
    /// `room_id` is `None` for user-wide events (e.g. "item created") and set
    /// for events delivered through a room subscription (e.g. presence).
    #[serde(rename_all = "camelCase")]
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default)]
        data: Value,
    },

    /// Error message
    Error { message: String },

    /// Pong response to ping
    Pong,
}

/// Payload of a [`PRESENCE_EVENT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub room_id: String,
    pub status: PresenceStatus,
}

/// Connectivity of the resource behind a room (a device or session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Connected,
    Disconnected,
}

impl PresenceStatus {
    pub fn label(self) -> &'static str {
        match self {
            PresenceStatus::Connected => "connected",
            PresenceStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Room ID validation
// ---------------------------------------------------------------------------

/// Validate a room ID.
///
/// Room IDs are device/session identifiers: non-empty, at most
/// [`MAX_ROOM_ID_LEN`] characters, and free of whitespace and control
/// characters.
pub fn validate_room_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("Room ID cannot be empty".to_string());
    }
    if id.chars().count() > MAX_ROOM_ID_LEN {
        return Err(format!(
            "Room ID must be at most {MAX_ROOM_ID_LEN} characters"
        ));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("Room ID cannot contain whitespace".to_string());
    }
    Ok(())
}
