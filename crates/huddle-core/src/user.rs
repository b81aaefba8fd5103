//! The user entity.
//!
//! A [`User`] is an immutable value. Lifecycle transitions produce a new
//! value with the changed fields; the registry swaps it in whole, so readers
//! never observe a half-updated record.

use huddle_protocol::UserRecord;
use std::time::Duration;

/// Opaque per-connection identifier.
pub type SessionId = String;

/// Stable user identity.
pub type UserId = String;

/// Room identifier.
pub type RoomId = String;

/// A user bound to a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Stable identity.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
    /// Session that owns this record.
    pub session_id: SessionId,
    /// Room the user is currently in, if any.
    pub current_room: Option<RoomId>,
    /// Whether the user is considered online.
    pub online: bool,
    /// Last activity, Unix milliseconds.
    pub last_seen: u64,
    /// First join, Unix milliseconds.
    pub created_at: u64,
}

impl User {
    /// Create a roomless, online user.
    #[must_use]
    pub fn new(
        session_id: impl Into<SessionId>,
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            session_id: session_id.into(),
            current_room: None,
            online: true,
            last_seen: now,
            created_at: now,
        }
    }

    /// Keep the creation time of an earlier record for the same user.
    #[must_use]
    pub fn created(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// The same user, online in `room_id`.
    #[must_use]
    pub fn in_room(&self, room_id: impl Into<RoomId>, now: u64) -> Self {
        Self {
            current_room: Some(room_id.into()),
            online: true,
            last_seen: now,
            ..self.clone()
        }
    }

    /// The same user after leaving their room: roomless and offline.
    #[must_use]
    pub fn left_room(&self, now: u64) -> Self {
        Self {
            current_room: None,
            online: false,
            last_seen: now,
            ..self.clone()
        }
    }

    /// The same user after a heartbeat.
    #[must_use]
    pub fn touched(&self, now: u64) -> Self {
        Self {
            online: true,
            last_seen: now,
            ..self.clone()
        }
    }

    /// Whether the user has been silent for longer than `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration, now: u64) -> bool {
        now.saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }

    /// Whether the user is in `room_id`.
    #[must_use]
    pub fn is_in(&self, room_id: &str) -> bool {
        self.current_room.as_deref() == Some(room_id)
    }
}

impl From<&User> for UserRecord {
    fn from(user: &User) -> Self {
        UserRecord {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            current_room: user.current_room.clone(),
            last_seen: user.last_seen,
            online: user.online,
            created_at: user.created_at,
        }
    }
}
