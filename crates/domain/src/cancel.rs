//! Cooperative cancellation tokens.
//!
//! Every invocation carries a [`CancelToken`]. Cancellation never aborts I/O;
//! the invoker observes the token at its next awaitable point and returns a
//! partial result with `finished_reason = Cancelled`. Timeouts are scheduled
//! cancellations layered on top of the same mechanism.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cancellation flag shared between the dispatcher and the invoker.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Tracks the active cancellation token per key (a session key for main-lane
/// invocations, `subagent:<id>` for sub-agent runs).
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a fresh token for a key, replacing any previous one.
    pub fn register(&self, key: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(key.to_owned(), token.clone());
        token
    }

    /// Cancel the registered token. Returns true if a token was found.
    pub fn cancel(&self, key: &str) -> bool {
        match self.tokens.lock().get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token for a key (called when the invocation finishes).
    pub fn remove(&self, key: &str) {
        self.tokens.lock().remove(key);
    }

    /// Whether a key currently has a registered (running) invocation.
    pub fn is_running(&self, key: &str) -> bool {
        self.tokens.lock().contains_key(key)
    }

    /// Cancel every registered token (used on shutdown).
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let token = map.register("telegram:1");
        assert!(map.is_running("telegram:1"));

        assert!(map.cancel("telegram:1"));
        assert!(token.is_cancelled());

        map.remove("telegram:1");
        assert!(!map.is_running("telegram:1"));
        assert!(!map.cancel("telegram:1"));
    }

    #[test]
    fn register_replaces_previous_token() {
        let map = CancelMap::new();
        let old = map.register("k");
        let new = map.register("k");

        map.cancel("k");
        assert!(new.is_cancelled());
        // The replaced token is orphaned and unaffected.
        assert!(!old.is_cancelled());
    }

    #[test]
    fn cancel_all_hits_every_token() {
        let map = CancelMap::new();
        let a = map.register("a");
        let b = map.register("b");
        assert_eq!(map.cancel_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn remove_is_idempotent() {
        let map = CancelMap::new();
        map.register("k");
        map.remove("k");
        map.remove("k");
        assert!(!map.is_running("k"));
    }
}
