//! Presence lifecycle.
//!
//! Per user: absent, online without a room, online in a room, offline.
//! Every transition runs under the lock stripes of its session and of the
//! user ids it touches, commits to the registry, and only then broadcasts.
//! Broadcasts never run under a lock.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::locks::Held;
use crate::user::{RoomId, User};
use huddle_protocol::{RoomPresenceRecord, RoomSummaryRecord, ServerEvent, Topic, UserRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Roster of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPresence {
    pub room_id: RoomId,
    /// Members, ordered by username then user id.
    pub users: Vec<Arc<User>>,
}

impl RoomPresence {
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl From<&RoomPresence> for RoomPresenceRecord {
    fn from(presence: &RoomPresence) -> Self {
        RoomPresenceRecord {
            room_id: presence.room_id.clone(),
            user_count: presence.user_count(),
            users: presence.users.iter().map(|u| UserRecord::from(&**u)).collect(),
        }
    }
}

/// One room and its head count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub member_count: usize,
}

impl From<&RoomSummary> for RoomSummaryRecord {
    fn from(summary: &RoomSummary) -> Self {
        RoomSummaryRecord {
            room_id: summary.room_id.clone(),
            user_count: summary.member_count,
        }
    }
}

impl Engine {
    /// Lock a session and the user ids it touches.
    ///
    /// Returns the session's user as seen under the locks; a takeover may
    /// have evicted the session while we waited.
    fn lock_session(
        &self,
        session_id: &str,
        joining: Option<&str>,
    ) -> (Held<'_>, Option<Arc<User>>) {
        let session = self.locks.session(session_id);
        let seen = self.registry.user_by_session(session_id);
        let mut user_ids: Vec<&str> = Vec::with_capacity(2);
        if let Some(user) = &seen {
            user_ids.push(&user.user_id);
        }
        user_ids.extend(joining);
        let held = self.locks.users(session, &user_ids);
        (held, self.registry.user_by_session(session_id))
    }

    /// Put a session's user into a room.
    ///
    /// Joining from another room leaves it first. A user id held by a
    /// different session is taken over: the older session is evicted.
    /// Never fails.
    pub fn join(&self, session_id: &str, user_id: &str, username: &str, room_id: &str) {
        let touched = {
            let (_held, previous) = self.lock_session(session_id, Some(user_id));
            self.join_locked(previous, session_id, user_id, username, room_id)
        };

        for room in &touched {
            self.broadcast_presence(room);
        }
        self.broadcast_room_list();
    }

    /// Returns every room whose roster changed, the joined room last.
    fn join_locked(
        &self,
        previous: Option<Arc<User>>,
        session_id: &str,
        user_id: &str,
        username: &str,
        room_id: &str,
    ) -> Vec<RoomId> {
        let now = self.clock.now_millis();
        let mut touched: Vec<RoomId> = Vec::new();
        let prior = self.registry.user(user_id);
        let created_at = prior.as_ref().map_or(now, |u| u.created_at);

        if let Some(old) = prior.filter(|u| u.session_id != session_id) {
            info!(
                user = %user_id,
                old_session = %old.session_id,
                session = %session_id,
                "User id taken over; evicting older session"
            );
            if let Some(evicted) = self.registry.remove_user_by_session(&old.session_id) {
                if let Some(room) = evicted.current_room.as_deref() {
                    if self.registry.remove_member(room, &evicted.user_id).changed() {
                        touched.push(room.to_string());
                    }
                }
            }
        }

        if let Some(previous) = previous {
            if let Some(old_room) = previous.current_room.as_deref() {
                if old_room != room_id || previous.user_id != user_id {
                    debug!(session = %session_id, from = %old_room, to = %room_id, "Switching rooms");
                    if self
                        .registry
                        .remove_member(old_room, &previous.user_id)
                        .changed()
                    {
                        touched.push(old_room.to_string());
                    }
                }
            }
            if previous.user_id != user_id {
                debug!(
                    session = %session_id,
                    from = %previous.user_id,
                    to = %user_id,
                    "Session re-identified"
                );
                self.registry
                    .remove_user_if_owned(&previous.user_id, session_id);
            }
        }

        let user = User::new(session_id, user_id, username, now)
            .created(created_at)
            .in_room(room_id, now);
        self.registry.upsert_user(Arc::new(user));
        if self.registry.add_member(room_id, user_id) {
            debug!(room = %room_id, "Room created by join");
        }
        info!(session = %session_id, user = %user_id, room = %room_id, "User joined room");

        touched.retain(|r| r != room_id);
        touched.dedup();
        touched.push(room_id.to_string());
        touched
    }

    /// Take a session's user out of their room and mark them offline.
    ///
    /// A user without a room is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UserNotFound`] if the session is unknown.
    pub fn leave(&self, session_id: &str) -> Result<(), EngineError> {
        let left = {
            let (_held, user) = self.lock_session(session_id, None);
            let user = user.ok_or_else(|| EngineError::UserNotFound(session_id.to_string()))?;
            self.leave_locked(&user)
        };

        if let Some(room) = left {
            self.broadcast_presence(&room);
            self.broadcast_room_list();
        }
        Ok(())
    }

    fn leave_locked(&self, user: &User) -> Option<RoomId> {
        let Some(room_id) = user.current_room.clone() else {
            warn!(session = %user.session_id, user = %user.user_id, "Leave without a current room");
            return None;
        };

        self.registry.remove_member(&room_id, &user.user_id);
        self.registry
            .upsert_user(Arc::new(user.left_room(self.clock.now_millis())));
        info!(session = %user.session_id, user = %user.user_id, room = %room_id, "User left room");
        Some(room_id)
    }

    /// Record a heartbeat. Unknown sessions are ignored.
    pub fn ping(&self, session_id: &str) {
        let (_held, user) = self.lock_session(session_id, None);
        match user {
            Some(user) => {
                self.registry
                    .upsert_user(Arc::new(user.touched(self.clock.now_millis())));
            }
            None => debug!(session = %session_id, "Ping for unknown session"),
        }
    }

    /// Forget a session entirely. Safe to call any number of times.
    pub fn disconnect(&self, session_id: &str) {
        self.disconnect_if(session_id, |_| true);
    }

    /// Disconnect a session only if it is still stale once locked.
    ///
    /// A ping or join that lands after the session was picked for pruning
    /// keeps it alive. Returns `true` if the session was disconnected.
    pub fn disconnect_if_stale(&self, session_id: &str, timeout: Duration, now: u64) -> bool {
        self.disconnect_if(session_id, |user| user.is_stale(timeout, now))
    }

    fn disconnect_if(&self, session_id: &str, should_drop: impl FnOnce(&User) -> bool) -> bool {
        let left = {
            let (_held, user) = self.lock_session(session_id, None);
            let Some(user) = user else {
                debug!(session = %session_id, "Disconnect of unknown session");
                return false;
            };
            if !should_drop(&user) {
                debug!(session = %session_id, "Session refreshed; keeping it");
                return false;
            }
            let left = match user.current_room {
                Some(_) => self.leave_locked(&user),
                None => None,
            };
            self.registry.remove_user_by_session(session_id);
            info!(session = %session_id, user = %user.user_id, "Session disconnected");
            left
        };

        if let Some(room) = left {
            self.broadcast_presence(&room);
            self.broadcast_room_list();
        }
        true
    }

    /// Create a room that stays listed while empty.
    ///
    /// Returns `true` if the room is new.
    pub fn create_room(&self, room_id: &str) -> bool {
        let created = self.registry.create_room(room_id);
        if created {
            info!(room = %room_id, "Room created");
            self.broadcast_room_list();
        }
        created
    }

    /// Current roster of a room; empty for unknown rooms.
    #[must_use]
    pub fn room_presence(&self, room_id: &str) -> RoomPresence {
        let mut users: Vec<Arc<User>> = self
            .registry
            .members_of(room_id)
            .iter()
            .filter_map(|user_id| {
                let user = self.registry.user(user_id);
                if user.is_none() {
                    warn!(room = %room_id, user = %user_id, "Member without a user record");
                }
                user
            })
            .collect();
        sort_users(&mut users);

        RoomPresence {
            room_id: room_id.to_string(),
            users,
        }
    }

    /// Every user currently flagged online.
    #[must_use]
    pub fn online_users(&self) -> Vec<Arc<User>> {
        let mut users: Vec<Arc<User>> = self
            .registry
            .users()
            .into_iter()
            .filter(|u| u.online)
            .collect();
        sort_users(&mut users);
        users
    }

    /// Every room with its member count, ordered by room id.
    #[must_use]
    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .registry
            .room_counts()
            .into_iter()
            .map(|(room_id, member_count)| RoomSummary {
                room_id,
                member_count,
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    #[must_use]
    pub fn user_by_session(&self, session_id: &str) -> Option<Arc<User>> {
        self.registry.user_by_session(session_id)
    }

    #[must_use]
    pub fn user_by_id(&self, user_id: &str) -> Option<Arc<User>> {
        self.registry.user(user_id)
    }

    #[must_use]
    pub fn room_member_count(&self, room_id: &str) -> usize {
        self.registry.member_count(room_id)
    }

    /// All room ids, sorted.
    #[must_use]
    pub fn all_room_ids(&self) -> Vec<RoomId> {
        let mut ids = self.registry.all_room_ids();
        ids.sort();
        ids
    }

    fn broadcast_presence(&self, room_id: &str) {
        let snapshot = self.room_presence(room_id);
        self.gateway.publish(
            Topic::Room(room_id.to_string()),
            ServerEvent::RoomPresence(RoomPresenceRecord::from(&snapshot)),
        );
    }

    fn broadcast_room_list(&self) {
        let rooms = self
            .room_summaries()
            .iter()
            .map(RoomSummaryRecord::from)
            .collect();
        self.gateway
            .publish(Topic::Rooms, ServerEvent::RoomList { rooms });
    }
}

fn sort_users(users: &mut [Arc<User>]) {
    users.sort_by(|a, b| {
        a.username
            .cmp(&b.username)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::NullPublisher;

    fn engine() -> Engine {
        Engine::new(Arc::new(NullPublisher))
    }

    fn names(presence: &RoomPresence) -> Vec<&str> {
        presence.users.iter().map(|u| u.username.as_str()).collect()
    }

    #[test]
    fn test_join_creates_room() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");

        let presence = engine.room_presence("r1");
        assert_eq!(presence.user_count(), 1);
        assert_eq!(names(&presence), vec!["Alice"]);
        assert!(engine.user_by_session("s1").unwrap().is_in("r1"));
    }

    #[test]
    fn test_switch_rooms() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.join("s2", "u2", "Bob", "r1");
        engine.join("s1", "u1", "Alice", "r2");

        assert_eq!(names(&engine.room_presence("r1")), vec!["Bob"]);
        assert_eq!(names(&engine.room_presence("r2")), vec!["Alice"]);
    }

    #[test]
    fn test_rejoin_same_room_is_idempotent() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.join("s1", "u1", "Alice", "r1");
        assert_eq!(engine.room_member_count("r1"), 1);
    }

    #[test]
    fn test_leave_without_room_is_noop() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.leave("s1").unwrap();
        engine.leave("s1").unwrap();

        let user = engine.user_by_session("s1").unwrap();
        assert!(!user.online);
        assert_eq!(user.current_room, None);
    }

    #[test]
    fn test_leave_unknown_session() {
        let engine = engine();
        assert_eq!(
            engine.leave("ghost"),
            Err(EngineError::UserNotFound("ghost".into()))
        );
    }

    #[test]
    fn test_ping_unknown_session_is_silent() {
        let engine = engine();
        engine.ping("ghost");
        assert_eq!(engine.registry().session_count(), 0);
    }

    #[test]
    fn test_ping_brings_user_back_online() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.leave("s1").unwrap();
        engine.ping("s1");
        assert!(engine.user_by_session("s1").unwrap().online);
    }

    #[test]
    fn test_created_at_survives_rejoin() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        let first = engine.user_by_id("u1").unwrap().created_at;
        engine.join("s1", "u1", "Alice", "r2");
        assert_eq!(engine.user_by_id("u1").unwrap().created_at, first);
    }

    #[test]
    fn test_re_identification_drops_old_user() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.join("s1", "u9", "Alicia", "r1");

        assert!(engine.user_by_id("u1").is_none());
        assert_eq!(names(&engine.room_presence("r1")), vec!["Alicia"]);
    }

    #[test]
    fn test_takeover_evicts_older_session() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.join("s2", "u1", "Alice", "r2");

        assert!(engine.user_by_session("s1").is_none());
        assert_eq!(engine.user_by_id("u1").unwrap().session_id, "s2");
        assert!(!engine.registry().room_exists("r1"));
        assert_eq!(engine.room_member_count("r2"), 1);

        // The evicted session's late disconnect must not touch the new owner.
        engine.disconnect("s1");
        assert!(engine.user_by_id("u1").unwrap().is_in("r2"));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        engine.disconnect("s1");
        engine.disconnect("s1");
        engine.disconnect("never-seen");

        assert!(engine.user_by_id("u1").is_none());
        assert!(engine.all_room_ids().is_empty());
    }

    #[test]
    fn test_created_room_survives_empty() {
        let engine = engine();
        assert!(engine.create_room("lobby"));
        assert!(!engine.create_room("lobby"));

        engine.join("s1", "u1", "Alice", "lobby");
        engine.disconnect("s1");

        let summaries = engine.room_summaries();
        assert_eq!(
            summaries,
            vec![RoomSummary {
                room_id: "lobby".into(),
                member_count: 0
            }]
        );
    }

    #[test]
    fn test_online_users_sorted() {
        let engine = engine();
        engine.join("s1", "u1", "Zed", "r1");
        engine.join("s2", "u2", "Amy", "r2");
        engine.join("s3", "u3", "Max", "r1");
        engine.leave("s3").unwrap();

        let online: Vec<_> = engine
            .online_users()
            .iter()
            .map(|u| u.username.clone())
            .collect();
        assert_eq!(online, vec!["Amy", "Zed"]);
    }

    #[test]
    fn test_presence_record() {
        let engine = engine();
        engine.join("s1", "u1", "Alice", "r1");
        let record = RoomPresenceRecord::from(&engine.room_presence("r1"));
        assert_eq!(record.user_count, 1);
        assert_eq!(record.users[0].user_id, "u1");

        let empty = RoomPresenceRecord::from(&engine.room_presence("nowhere"));
        assert_eq!(empty, RoomPresenceRecord::empty("nowhere"));
    }
}
