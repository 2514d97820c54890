use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};

/// Per-session exclusive locks.
///
/// Only mutexes live here, never graph state. Sessions are independent,
/// so picks in different sessions never wait on each other.
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

/// Held for the whole read-decide-write span of a pick or removal.
pub struct SessionGuard {
    pub session_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait at most `timeout` for exclusive access to `session_id`.
    pub async fn acquire(&self, session_id: i64, timeout: Duration) -> Result<SessionGuard> {
        // Clone the Arc out so the map shard is not held while waiting.
        let lock = self
            .locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(SessionGuard {
                session_id,
                _guard: guard,
            }),
            Err(_) => {
                log::debug!("Timed out waiting for session {}", session_id);
                Err(Error::Busy)
            }
        }
    }

    /// Drop the lock of a session nobody is using.
    pub fn forget(&self, session_id: i64) {
        self.locks
            .remove_if(&session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        log::trace!("Released session {}", self.session_id);
    }
}
