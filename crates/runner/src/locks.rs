//! Per-session run locks.
//!
//! At most one main-lane invocation runs per session at a time. `/new` and
//! `/compact` take the same lock, which is how they wait out (never cancel)
//! an in-flight invocation before rotating the conversation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Maps each session key to a one-permit semaphore.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the run lock for a session, waiting behind any holder.
    /// The permit releases on drop.
    pub async fn acquire(&self, session_key: &str) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned()
            .await
            .expect("session semaphore never closed")
    }

    /// Whether the session's lock is currently held.
    pub fn is_held(&self, session_key: &str) -> bool {
        self.locks
            .lock()
            .get(session_key)
            .map_or(false, |sem| sem.available_permits() == 0)
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop entries whose lock is not held.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_acquire() {
        let map = SessionLockMap::new();
        drop(map.acquire("s1").await);
        drop(map.acquire("s1").await);
    }

    #[tokio::test]
    async fn different_sessions_do_not_contend() {
        let map = SessionLockMap::new();
        let _a = map.acquire("s1").await;
        let _b = map.acquire("s2").await;
        assert!(map.is_held("s1"));
        assert!(map.is_held("s2"));
    }

    #[tokio::test]
    async fn same_session_waits_for_release() {
        let map = Arc::new(SessionLockMap::new());
        let permit = map.acquire("s1").await;

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire("s1").await;
            7
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let map = SessionLockMap::new();
        let _held = map.acquire("busy").await;
        drop(map.acquire("idle").await);

        map.prune_idle();
        assert_eq!(map.session_count(), 1);
        assert!(map.is_held("busy"));
    }
}
