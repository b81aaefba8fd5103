//! Wire records exchanged with clients.
//!
//! These are plain data carriers. The engine owns the canonical entities and
//! converts them into records at the edge.

use serde::{Deserialize, Serialize};

/// A user as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_room: Option<String>,
    /// Unix milliseconds.
    pub last_seen: u64,
    pub online: bool,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Roster of one room at the instant it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPresenceRecord {
    pub room_id: String,
    pub user_count: usize,
    pub users: Vec<UserRecord>,
}

impl RoomPresenceRecord {
    /// An empty roster for a room nobody is in.
    #[must_use]
    pub fn empty(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            user_count: 0,
            users: Vec::new(),
        }
    }
}

/// Catalog entry for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummaryRecord {
    pub room_id: String,
    pub user_count: usize,
}

/// A chat message posted to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub message_id: String,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// Kind of a call-signaling payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    End,
}

impl SignalKind {
    /// Name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::End => "end",
        }
    }
}

/// A call signal relayed from one room member to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub room_id: String,
    pub from_user_id: String,
    pub from_username: String,
    pub target_user_id: String,
    /// `kind` is taken by the event tag when this travels as a `ServerEvent`.
    #[serde(rename = "signal_kind")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Process-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatsRecord {
    pub total_users: usize,
    pub active_sessions: usize,
    pub active_rooms: usize,
    pub online_users: usize,
    /// Unix milliseconds.
    pub timestamp: u64,
}
