//! The presence and room state engine.
//!
//! [`Engine`] owns the registry, the chat log and the broadcast gateway.
//! It is built once at process start and handed to the transport by
//! reference; operations live in the [`presence`](crate::presence),
//! [`chat`](crate::chat) and [`signal`](crate::signal) modules.

use crate::chat::{ChatLog, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_ROOMS};
use crate::clock::{Clock, SystemClock};
use crate::gateway::{Gateway, Publisher};
use crate::locks::{LifecycleLocks, DEFAULT_STRIPES};
use crate::registry::Registry;
use crate::user::SessionId;
use huddle_protocol::SystemStatsRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chat messages retained per room.
    pub history_capacity: usize,
    /// Rooms whose chat history is retained.
    pub history_rooms: usize,
    /// Lock stripes per level (sessions, user ids).
    pub lock_stripes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_rooms: DEFAULT_HISTORY_ROOMS,
            lock_stripes: DEFAULT_STRIPES,
        }
    }
}

/// The presence and room state engine.
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) history: ChatLog,
    pub(crate) gateway: Gateway,
    pub(crate) locks: LifecycleLocks,
    pub(crate) clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self::with_config(EngineConfig::default(), publisher)
    }

    /// Create an engine with custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self::with_clock(config, publisher, Arc::new(SystemClock))
    }

    /// Create an engine reading time from `clock`.
    #[must_use]
    pub fn with_clock(
        config: EngineConfig,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!("Creating engine with config: {:?}", config);
        Self {
            registry: Registry::new(),
            history: ChatLog::new(config.history_capacity, config.history_rooms),
            gateway: Gateway::new(publisher),
            locks: LifecycleLocks::new(config.lock_stripes),
            clock,
            config,
        }
    }

    /// The engine's configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-only access to the registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process-wide counters.
    #[must_use]
    pub fn system_stats(&self) -> SystemStats {
        let users = self.registry.users();
        SystemStats {
            total_users: users.len(),
            active_sessions: self.registry.session_count(),
            active_rooms: self.registry.room_count(),
            online_users: users.iter().filter(|u| u.online).count(),
            timestamp: self.clock.now_millis(),
        }
    }

    /// Sessions whose user has been silent for longer than `timeout` at `now`.
    #[must_use]
    pub fn stale_sessions(&self, timeout: Duration, now: u64) -> Vec<SessionId> {
        self.registry
            .session_ids()
            .into_iter()
            .filter(|session_id| {
                self.registry
                    .user_by_session(session_id)
                    .is_some_and(|u| u.is_stale(timeout, now))
            })
            .collect()
    }

    /// Disconnect every session silent for longer than `timeout`.
    ///
    /// Each candidate is checked again under its session lock, so a
    /// heartbeat racing the sweep wins. Returns the pruned session ids.
    pub fn prune_stale(&self, timeout: Duration) -> Vec<SessionId> {
        let now = self.clock.now_millis();
        self.stale_sessions(timeout, now)
            .into_iter()
            .filter(|session_id| {
                let pruned = self.disconnect_if_stale(session_id, timeout, now);
                if pruned {
                    info!(session = %session_id, "Pruned stale session");
                }
                pruned
            })
            .collect()
    }

    /// Disconnect every session so subscribers see final presence.
    pub fn shutdown(&self) {
        let sessions = self.registry.session_ids();
        info!(sessions = sessions.len(), "Shutting down engine");
        for session_id in sessions {
            self.disconnect(&session_id);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("sessions", &self.registry.session_count())
            .field("rooms", &self.registry.room_count())
            .finish()
    }
}

/// Engine statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStats {
    /// Number of user records.
    pub total_users: usize,
    /// Number of live sessions.
    pub active_sessions: usize,
    /// Number of rooms, pinned ones included.
    pub active_rooms: usize,
    /// Number of users flagged online.
    pub online_users: usize,
    /// When the counters were read, Unix milliseconds.
    pub timestamp: u64,
}

impl From<SystemStats> for SystemStatsRecord {
    fn from(stats: SystemStats) -> Self {
        SystemStatsRecord {
            total_users: stats.total_users,
            active_sessions: stats.active_sessions,
            active_rooms: stats.active_rooms,
            online_users: stats.online_users,
            timestamp: stats.timestamp,
        }
    }
}
