//! Topic naming for broadcasts.
//!
//! Every broadcast the engine emits is addressed to a [`Topic`]. Room-scoped
//! topics are keyed by room id; call signals go to a queue addressed to a
//! single user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ROOM_PREFIX: &str = "/topic/room/";
const CHAT_SUFFIX: &str = "/chat";
const ROOMS: &str = "/topic/rooms";
const USER_PREFIX: &str = "/user/";
const SIGNAL_SUFFIX: &str = "/queue/signal";

/// A broadcast destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Topic {
    /// Presence snapshots for one room.
    Room(String),
    /// Chat messages posted to one room.
    RoomChat(String),
    /// The room catalog.
    Rooms,
    /// Point-to-point call signals for one user.
    User(String),
}

impl Topic {
    /// Whether clients may subscribe to this topic themselves.
    ///
    /// User queues are subscribed by the server on behalf of the session
    /// that joined as that user.
    #[must_use]
    pub fn is_public(&self) -> bool {
        !matches!(self, Topic::User(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Room(room) => write!(f, "{ROOM_PREFIX}{room}"),
            Topic::RoomChat(room) => write!(f, "{ROOM_PREFIX}{room}{CHAT_SUFFIX}"),
            Topic::Rooms => f.write_str(ROOMS),
            Topic::User(user) => write!(f, "{USER_PREFIX}{user}{SIGNAL_SUFFIX}"),
        }
    }
}

impl FromStr for Topic {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ROOMS {
            return Ok(Topic::Rooms);
        }
        if let Some(rest) = s.strip_prefix(ROOM_PREFIX) {
            // Room ids may not contain '/', so a chat suffix is unambiguous.
            let (room, chat) = match rest.strip_suffix(CHAT_SUFFIX) {
                Some(room) => (room, true),
                None => (rest, false),
            };
            if room.is_empty() || room.contains('/') {
                return Err("Invalid room topic");
            }
            return Ok(if chat {
                Topic::RoomChat(room.to_string())
            } else {
                Topic::Room(room.to_string())
            });
        }
        if let Some(user) = s
            .strip_prefix(USER_PREFIX)
            .and_then(|rest| rest.strip_suffix(SIGNAL_SUFFIX))
        {
            if user.is_empty() || user.contains('/') {
                return Err("Invalid user queue");
            }
            return Ok(Topic::User(user.to_string()));
        }
        Err("Unknown topic")
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> String {
        topic.to_string()
    }
}

impl TryFrom<String> for Topic {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
