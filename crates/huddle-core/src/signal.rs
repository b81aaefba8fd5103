//! Call-signal relay.
//!
//! Signals (offer, answer, ICE candidates, hang-up) travel point-to-point:
//! they go to the target user's own queue, never to the room topic, and are
//! not stored.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::user::{RoomId, UserId};
use huddle_protocol::{ServerEvent, SignalKind, SignalRecord, Topic};
use tracing::{debug, warn};

/// A signal in flight between two room members.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub room_id: RoomId,
    pub from_user_id: UserId,
    pub from_username: String,
    pub target_user_id: UserId,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
}

impl From<SignalEnvelope> for SignalRecord {
    fn from(envelope: SignalEnvelope) -> Self {
        SignalRecord {
            room_id: envelope.room_id,
            from_user_id: envelope.from_user_id,
            from_username: envelope.from_username,
            target_user_id: envelope.target_user_id,
            kind: envelope.kind,
            payload: envelope.payload,
        }
    }
}

impl Engine {
    /// Forward a signal to one member of a room.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UserNotFound`] if the session is unknown, and
    /// [`EngineError::InvalidTarget`] if the target is not currently in
    /// `room_id`.
    pub fn relay_signal(
        &self,
        session_id: &str,
        room_id: &str,
        target_user_id: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        let sender = self
            .registry
            .user_by_session(session_id)
            .ok_or_else(|| EngineError::UserNotFound(session_id.to_string()))?;

        if !self.registry.is_member(room_id, target_user_id) {
            warn!(
                room = %room_id,
                from = %sender.user_id,
                target = %target_user_id,
                "Signal target is not in the room"
            );
            return Err(EngineError::InvalidTarget {
                room_id: room_id.to_string(),
                target_user_id: target_user_id.to_string(),
            });
        }

        let envelope = SignalEnvelope {
            room_id: room_id.to_string(),
            from_user_id: sender.user_id.clone(),
            from_username: sender.username.clone(),
            target_user_id: target_user_id.to_string(),
            kind,
            payload,
        };

        let reached = self.gateway.publish(
            Topic::User(target_user_id.to_string()),
            ServerEvent::CallSignal(envelope.into()),
        );
        debug!(
            room = %room_id,
            from = %sender.user_id,
            target = %target_user_id,
            kind = kind.as_str(),
            reached,
            "Relayed signal"
        );
        Ok(())
    }
}
