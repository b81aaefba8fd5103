//! Striped lifecycle locks.
//!
//! Lifecycle operations touch several registry maps. An operation first
//! takes the stripe of its session, then the stripes of every user id it
//! reads or writes, in ascending stripe order. No thread takes a session
//! stripe while holding a user stripe, and none holds two session stripes,
//! so the two levels cannot deadlock. Stripes are never held across a
//! broadcast.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of stripes per level.
pub(crate) const DEFAULT_STRIPES: usize = 64;

struct Stripes {
    locks: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl Stripes {
    fn new(stripes: usize) -> Self {
        Self {
            locks: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) as usize) % self.locks.len()
    }

    fn acquire(&self, index: usize) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned stripe carries no
        // broken state.
        self.locks[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct LifecycleLocks {
    sessions: Stripes,
    users: Stripes,
}

/// The stripe of one session.
pub(crate) struct SessionGuard<'a> {
    _session: MutexGuard<'a, ()>,
}

/// A session stripe plus the user stripes taken under it.
pub(crate) struct Held<'a> {
    _session: SessionGuard<'a>,
    _users: Vec<MutexGuard<'a, ()>>,
}

impl LifecycleLocks {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            sessions: Stripes::new(stripes),
            users: Stripes::new(stripes),
        }
    }

    /// Lock the stripe of one session.
    pub(crate) fn session(&self, session_id: &str) -> SessionGuard<'_> {
        SessionGuard {
            _session: self.sessions.acquire(self.sessions.index(session_id)),
        }
    }

    /// Lock the stripes of `user_ids` under an already held session stripe.
    pub(crate) fn users<'a>(&'a self, session: SessionGuard<'a>, user_ids: &[&str]) -> Held<'a> {
        let mut indexes: Vec<usize> = user_ids.iter().map(|id| self.users.index(id)).collect();
        indexes.sort_unstable();
        indexes.dedup();
        Held {
            _session: session,
            _users: indexes.into_iter().map(|i| self.users.acquire(i)).collect(),
        }
    }
}

impl Default for LifecycleLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl std::fmt::Debug for LifecycleLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleLocks")
            .field("stripes", &self.sessions.locks.len())
            .finish()
    }
}
