//! Chat messages and per-room history.
//!
//! Each room keeps its most recent messages in a bounded buffer; once full,
//! appending evicts the oldest message. History outlives room membership:
//! a room that empties and is later re-joined still shows its buffer. The
//! number of buffers is bounded too; past the limit the room that has been
//! quiet longest loses its history.

use crate::clock::Clock;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::user::{RoomId, UserId};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use huddle_protocol::{ChatRecord, ServerEvent, Topic};
use std::collections::VecDeque;
use tracing::{debug, info};
use uuid::Uuid;

/// Default number of messages retained per room.
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

/// Default number of rooms whose history is retained.
pub const DEFAULT_HISTORY_ROOMS: usize = 10_000;

/// An immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message_id: String,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: u64,
}

impl ChatMessage {
    /// Create a message with a fresh id.
    #[must_use]
    pub fn new(
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            username: username.into(),
            content: content.into(),
            timestamp,
        }
    }
}

impl From<&ChatMessage> for ChatRecord {
    fn from(msg: &ChatMessage) -> Self {
        ChatRecord {
            message_id: msg.message_id.clone(),
            room_id: msg.room_id.clone(),
            user_id: msg.user_id.clone(),
            username: msg.username.clone(),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        }
    }
}

/// A bounded, append-only message buffer.
#[derive(Debug)]
pub struct ChatBuffer {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl ChatBuffer {
    /// Create a buffer holding at most `capacity` messages (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Append a message, returning the evicted one if the buffer was full.
    pub fn push(&mut self, message: ChatMessage) -> Option<ChatMessage> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    /// Messages, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Timestamp of the newest message.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<u64> {
        self.messages.back().map(|m| m.timestamp)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Chat buffers for the rooms that have seen a message.
#[derive(Debug)]
pub struct ChatLog {
    rooms: DashMap<RoomId, ChatBuffer>,
    capacity: usize,
    max_rooms: usize,
}

impl ChatLog {
    /// Create a log retaining `capacity` messages in each of at most
    /// `max_rooms` rooms.
    #[must_use]
    pub fn new(capacity: usize, max_rooms: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity,
            max_rooms: max_rooms.max(1),
        }
    }

    /// Create, stamp and append a message in one step.
    ///
    /// The timestamp is read while the room's buffer is locked and never
    /// precedes the newest message already there, so a room's history
    /// stays in creation order under concurrent senders.
    pub fn post(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        content: &str,
        clock: &dyn Clock,
    ) -> ChatMessage {
        let message = {
            let mut buffer = self.buffer(room_id);
            let timestamp = clock
                .now_millis()
                .max(buffer.last_timestamp().unwrap_or(0));
            let message = ChatMessage::new(room_id, user_id, username, content, timestamp);
            if let Some(evicted) = buffer.push(message.clone()) {
                debug!(room = %room_id, message = %evicted.message_id, "Evicted oldest message");
            }
            message
        };
        self.enforce_room_limit(room_id);
        message
    }

    /// Append an already built message to its room's buffer.
    pub fn append(&self, message: ChatMessage) {
        let room_id = message.room_id.clone();
        if let Some(evicted) = self.buffer(&room_id).push(message) {
            debug!(room = %room_id, message = %evicted.message_id, "Evicted oldest message");
        }
        self.enforce_room_limit(&room_id);
    }

    fn buffer(&self, room_id: &str) -> RefMut<'_, RoomId, ChatBuffer> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| ChatBuffer::with_capacity(self.capacity))
    }

    /// Drop the quietest room other than `keep` while over the limit.
    ///
    /// Must not be called with a buffer guard held.
    fn enforce_room_limit(&self, keep: &str) {
        while self.rooms.len() > self.max_rooms {
            let quietest = self
                .rooms
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().last_timestamp().unwrap_or(0))
                .map(|entry| entry.key().clone());
            let Some(room_id) = quietest else {
                return;
            };
            if self.rooms.remove(&room_id).is_some() {
                debug!(room = %room_id, "Dropped history of quietest room");
            }
        }
    }

    /// A room's messages, oldest first; empty for unknown rooms.
    #[must_use]
    pub fn history(&self, room_id: &str) -> Vec<ChatMessage> {
        self.rooms
            .get(room_id)
            .map(|b| b.to_vec())
            .unwrap_or_default()
    }

    /// Number of rooms with a buffer.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Engine {
    /// Post a message to a room.
    ///
    /// The sender must currently be a member of `room_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UserNotFound`] if the session is unknown or
    /// its user is not in the room.
    pub fn send_chat(
        &self,
        session_id: &str,
        room_id: &str,
        content: &str,
    ) -> Result<ChatMessage, EngineError> {
        let user = self
            .registry
            .user_by_session(session_id)
            .ok_or_else(|| EngineError::UserNotFound(session_id.to_string()))?;

        if !user.is_in(room_id) || !self.registry.is_member(room_id, &user.user_id) {
            debug!(session = %session_id, room = %room_id, "Chat from non-member rejected");
            return Err(EngineError::UserNotFound(format!(
                "{} in room {}",
                user.user_id, room_id
            )));
        }

        let message = self.history.post(
            room_id,
            &user.user_id,
            &user.username,
            content,
            self.clock.as_ref(),
        );

        info!(
            room = %room_id,
            user = %user.user_id,
            message = %message.message_id,
            "Chat message posted"
        );

        self.gateway.publish(
            Topic::RoomChat(room_id.to_string()),
            ServerEvent::Chat(ChatRecord::from(&message)),
        );
        Ok(message)
    }

    /// A room's retained messages, oldest first.
    ///
    /// Unknown or silent rooms yield an empty list.
    #[must_use]
    pub fn chat_history(&self, room_id: &str) -> Vec<ChatMessage> {
        self.history.history(room_id)
    }
}
