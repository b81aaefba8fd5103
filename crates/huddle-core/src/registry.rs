//! User and room registry.
//!
//! Three independent concurrent maps hold all engine state:
//!
//! - session id -> user
//! - user id -> user
//! - room id -> member set
//!
//! Each operation is atomic with respect to a single key. Keeping the maps
//! consistent with each other (a user's `current_room` matching room
//! membership) is the lifecycle manager's job.

use crate::user::{RoomId, SessionId, User, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Membership of one room.
#[derive(Debug, Default)]
struct RoomEntry {
    members: HashSet<UserId>,
    /// Explicitly created rooms survive becoming empty.
    pinned: bool,
}

/// Outcome of removing a member from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The user was not a member (or the room does not exist).
    NotMember,
    /// The user was removed and the room is still listed.
    Removed,
    /// The user was removed and the now empty room was deleted.
    RoomDeleted,
}

impl Removal {
    /// Whether membership actually changed.
    #[must_use]
    pub fn changed(self) -> bool {
        !matches!(self, Removal::NotMember)
    }
}

/// The canonical store of sessions, users and room membership.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<SessionId, Arc<User>>,
    users: DashMap<UserId, Arc<User>>,
    rooms: DashMap<RoomId, RoomEntry>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user under both its session and its user id.
    ///
    /// Returns the record the session held before, if any.
    pub fn upsert_user(&self, user: Arc<User>) -> Option<Arc<User>> {
        self.users.insert(user.user_id.clone(), Arc::clone(&user));
        let previous = self.sessions.insert(user.session_id.clone(), user);
        trace!(previous = previous.is_some(), "Upserted user");
        previous
    }

    /// Remove a session and, if it still owns it, its user record.
    ///
    /// A user id taken over by a newer session is left alone.
    pub fn remove_user_by_session(&self, session_id: &str) -> Option<Arc<User>> {
        let (_, user) = self.sessions.remove(session_id)?;
        self.remove_user_if_owned(&user.user_id, session_id);
        debug!(session = %session_id, user = %user.user_id, "Removed session");
        Some(user)
    }

    /// Remove the record for `user_id` only if `session_id` owns it.
    pub fn remove_user_if_owned(&self, user_id: &str, session_id: &str) -> Option<Arc<User>> {
        self.users
            .remove_if(user_id, |_, user| user.session_id == session_id)
            .map(|(_, user)| user)
    }

    /// Look up the user bound to a session.
    #[must_use]
    pub fn user_by_session(&self, session_id: &str) -> Option<Arc<User>> {
        self.sessions.get(session_id).map(|u| Arc::clone(u.value()))
    }

    /// Look up a user by id.
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<Arc<User>> {
        self.users.get(user_id).map(|u| Arc::clone(u.value()))
    }

    /// Create a room that stays listed while empty.
    ///
    /// Returns `true` if the room did not exist before.
    pub fn create_room(&self, room_id: &str) -> bool {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().pinned = true;
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(RoomEntry {
                    members: HashSet::new(),
                    pinned: true,
                });
                debug!(room = %room_id, "Created pinned room");
                true
            }
        }
    }

    /// Add a user to a room, creating the room if needed.
    ///
    /// Returns `true` if the room was created by this call.
    pub fn add_member(&self, room_id: &str, user_id: &str) -> bool {
        let mut created = false;
        let mut entry = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            RoomEntry::default()
        });
        entry.members.insert(user_id.to_string());
        trace!(room = %room_id, user = %user_id, members = entry.members.len(), "Added member");
        created
    }

    /// Remove a user from a room.
    ///
    /// The room is deleted once empty unless it was explicitly created.
    pub fn remove_member(&self, room_id: &str, user_id: &str) -> Removal {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_id.to_string()) else {
            return Removal::NotMember;
        };
        if !entry.get_mut().members.remove(user_id) {
            return Removal::NotMember;
        }
        if entry.get().members.is_empty() && !entry.get().pinned {
            entry.remove();
            debug!(room = %room_id, "Deleted empty room");
            return Removal::RoomDeleted;
        }
        Removal::Removed
    }

    /// Member ids of a room; empty for unknown rooms.
    #[must_use]
    pub fn members_of(&self, room_id: &str) -> Vec<UserId> {
        self.rooms
            .get(room_id)
            .map(|r| r.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `user_id` is in `room_id`.
    #[must_use]
    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|r| r.members.contains(user_id))
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|r| r.members.len()).unwrap_or(0)
    }

    /// Whether a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// All room ids.
    #[must_use]
    pub fn all_room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Every room with its member count.
    #[must_use]
    pub fn room_counts(&self) -> Vec<(RoomId, usize)> {
        self.rooms
            .iter()
            .map(|e| (e.key().clone(), e.members.len()))
            .collect()
    }

    /// Every user record.
    #[must_use]
    pub fn users(&self) -> Vec<Arc<User>> {
        self.users.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Every session id.
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of user records.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
