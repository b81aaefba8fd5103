//! Frame types for the Huddle protocol.
//!
//! Clients send [`ClientFrame`]s; the server answers with [`ServerFrame`]s and
//! pushes [`ServerEvent`]s for every topic the connection is subscribed to.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::records::{
    ChatRecord, RoomPresenceRecord, RoomSummaryRecord, SignalKind, SignalRecord,
    SystemStatsRecord, UserRecord,
};
use crate::topic::Topic;

/// Maximum length of a user, room or topic identifier.
pub const MAX_ID_LENGTH: usize = 256;

/// Maximum length of a chat message body.
pub const MAX_CHAT_LENGTH: usize = 4096;

/// A frame sent by a client.
///
/// Request frames carry an `id` chosen by the client; it is echoed in the
/// reply so the client can match them up. It defaults to 0 when omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Protocol handshake.
    Connect { version: u8 },

    /// Enter a room, switching out of the current one if needed.
    Join {
        #[serde(default)]
        id: u64,
        user_id: String,
        username: String,
        room_id: String,
    },

    /// Leave the current room.
    Leave {
        #[serde(default)]
        id: u64,
    },

    /// Heartbeat.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Create a room that stays listed while empty.
    CreateRoom {
        #[serde(default)]
        id: u64,
        room_id: String,
    },

    /// Start receiving a topic.
    Subscribe {
        #[serde(default)]
        id: u64,
        topic: String,
    },

    /// Stop receiving a topic.
    Unsubscribe {
        #[serde(default)]
        id: u64,
        topic: String,
    },

    /// Ask for a room's roster.
    RoomPresence {
        #[serde(default)]
        id: u64,
        room_id: String,
    },

    /// Ask for every online user.
    OnlineUsers {
        #[serde(default)]
        id: u64,
    },

    /// Ask for the room catalog.
    RoomList {
        #[serde(default)]
        id: u64,
    },

    /// Post to a room.
    Chat {
        #[serde(default)]
        id: u64,
        room_id: String,
        content: String,
    },

    /// Ask for a room's retained chat.
    ChatHistory {
        #[serde(default)]
        id: u64,
        room_id: String,
    },

    /// Relay a call signal to one room member.
    CallSignal {
        #[serde(default)]
        id: u64,
        room_id: String,
        target_user_id: String,
        kind: SignalKind,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Ask for process-wide counters.
    SystemStats {
        #[serde(default)]
        id: u64,
    },
}

impl ClientFrame {
    /// Short name, used for logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "connect",
            ClientFrame::Join { .. } => "join",
            ClientFrame::Leave { .. } => "leave",
            ClientFrame::Ping { .. } => "ping",
            ClientFrame::CreateRoom { .. } => "create_room",
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::RoomPresence { .. } => "room_presence",
            ClientFrame::OnlineUsers { .. } => "online_users",
            ClientFrame::RoomList { .. } => "room_list",
            ClientFrame::Chat { .. } => "chat",
            ClientFrame::ChatHistory { .. } => "chat_history",
            ClientFrame::CallSignal { .. } => "call_signal",
            ClientFrame::SystemStats { .. } => "system_stats",
        }
    }

    /// Request id, or 0 for frames that carry none.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        match self {
            ClientFrame::Connect { .. } | ClientFrame::Ping { .. } => 0,
            ClientFrame::Join { id, .. }
            | ClientFrame::Leave { id }
            | ClientFrame::CreateRoom { id, .. }
            | ClientFrame::Subscribe { id, .. }
            | ClientFrame::Unsubscribe { id, .. }
            | ClientFrame::RoomPresence { id, .. }
            | ClientFrame::OnlineUsers { id }
            | ClientFrame::RoomList { id }
            | ClientFrame::Chat { id, .. }
            | ClientFrame::ChatHistory { id, .. }
            | ClientFrame::CallSignal { id, .. }
            | ClientFrame::SystemStats { id } => *id,
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientFrame::Join {
                user_id,
                username,
                room_id,
                ..
            } => {
                validate_id("user_id", user_id)?;
                validate_name("username", username)?;
                validate_id("room_id", room_id)
            }
            ClientFrame::CreateRoom { room_id, .. }
            | ClientFrame::RoomPresence { room_id, .. }
            | ClientFrame::ChatHistory { room_id, .. } => validate_id("room_id", room_id),
            ClientFrame::Subscribe { topic, .. } | ClientFrame::Unsubscribe { topic, .. } => {
                if topic.len() > MAX_ID_LENGTH * 2 {
                    return Err(ProtocolError::Invalid("topic is too long".into()));
                }
                Ok(())
            }
            ClientFrame::Chat {
                room_id, content, ..
            } => {
                validate_id("room_id", room_id)?;
                if content.trim().is_empty() {
                    return Err(ProtocolError::Invalid("content is required".into()));
                }
                if content.chars().count() > MAX_CHAT_LENGTH {
                    return Err(ProtocolError::Invalid("content is too long".into()));
                }
                Ok(())
            }
            ClientFrame::CallSignal {
                room_id,
                target_user_id,
                ..
            } => {
                validate_id("room_id", room_id)?;
                validate_id("target_user_id", target_user_id)
            }
            ClientFrame::Connect { .. }
            | ClientFrame::Leave { .. }
            | ClientFrame::Ping { .. }
            | ClientFrame::OnlineUsers { .. }
            | ClientFrame::RoomList { .. }
            | ClientFrame::SystemStats { .. } => Ok(()),
        }
    }
}

/// Identifiers end up inside topic names, so '/' is not allowed.
fn validate_id(field: &str, value: &str) -> Result<(), ProtocolError> {
    validate_name(field, value)?;
    if value.contains('/') {
        return Err(ProtocolError::Invalid(format!("{field} must not contain '/'")));
    }
    Ok(())
}

fn validate_name(field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::Invalid(format!("{field} is required")));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ProtocolError::Invalid(format!("{field} is too long")));
    }
    if value.chars().any(char::is_control) {
        return Err(ProtocolError::Invalid(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

/// An event published on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A room's roster changed.
    RoomPresence(RoomPresenceRecord),
    /// A chat message was posted.
    Chat(ChatRecord),
    /// The room catalog changed.
    RoomList { rooms: Vec<RoomSummaryRecord> },
    /// A call signal addressed to the subscriber.
    CallSignal(SignalRecord),
    /// Server notice.
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        content: String,
    },
}

impl ServerEvent {
    /// Create a server notice.
    #[must_use]
    pub fn system(content: impl Into<String>, room_id: Option<String>) -> Self {
        ServerEvent::System {
            room_id,
            content: content.into(),
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Connection established.
    Connected {
        session_id: String,
        version: u8,
        /// Recommended ping interval in milliseconds.
        heartbeat: u32,
    },

    /// Request succeeded.
    Ack { id: u64 },

    /// Request failed.
    Error { id: u64, code: u16, message: String },

    /// Heartbeat reply.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Something happened on a subscribed topic.
    Event { topic: Topic, event: ServerEvent },

    /// Reply to `room_presence`.
    RoomPresence {
        id: u64,
        presence: RoomPresenceRecord,
    },

    /// Reply to `online_users`.
    OnlineUsers { id: u64, users: Vec<UserRecord> },

    /// Reply to `room_list`.
    RoomList {
        id: u64,
        rooms: Vec<RoomSummaryRecord>,
    },

    /// Reply to `chat_history`, oldest message first.
    ChatHistory {
        id: u64,
        room_id: String,
        messages: Vec<ChatRecord>,
    },

    /// Reply to `system_stats`.
    SystemStats { id: u64, stats: SystemStatsRecord },

    /// Reply to `chat`.
    ChatSent { id: u64, message_id: String },
}

impl ServerFrame {
    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ServerFrame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerFrame::Connected {
            session_id: session_id.into(),
            version,
            heartbeat,
        }
    }

    /// Wrap a topic event.
    #[must_use]
    pub fn event(topic: Topic, event: ServerEvent) -> Self {
        ServerFrame::Event { topic, event }
    }
}
