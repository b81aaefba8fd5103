//! Engine errors.

use thiserror::Error;

/// Errors returned to the caller of an engine operation.
///
/// Lifecycle no-ops (ping on an unknown session, leave without a room,
/// repeated disconnect) are not errors and never produce one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The session or user the operation needs does not exist.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Signal target is not currently a member of the room.
    #[error("Invalid signal target {target_user_id} in room {room_id}")]
    InvalidTarget {
        room_id: String,
        target_user_id: String,
    },
}

impl EngineError {
    /// Short name, used for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UserNotFound(_) => "user_not_found",
            EngineError::InvalidTarget { .. } => "invalid_target",
        }
    }
}
