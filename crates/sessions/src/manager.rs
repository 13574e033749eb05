//! Session key → thread id mapping and conversation rotation.
//!
//! Conversation ids are UTC timestamps (`conv_2025-06-15T10-00-00-000123`),
//! which makes them monotone and sortable. The thread id handed to the
//! invoker is `"{session_key}:{conversation_id}"`; rotating the
//! conversation (via `/new` or `/compact`) therefore changes the thread id
//! without touching the session key.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Public view of one session's conversation state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub conversation_id: String,
    pub started_at: DateTime<Utc>,
    pub message_count: u64,
}

struct SessionEntry {
    state: SessionState,
    /// Timestamp backing the current conversation id; the rotation guard
    /// ensures the next id is strictly later even within one microsecond.
    conversation_ts: DateTime<Utc>,
    /// Content to prepend to the first user message of the next dispatch
    /// (set by `/compact` with the conversation summary).
    seed: Option<String>,
}

/// Per-workspace session registry. Owned exclusively by one runner.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the thread id for a session, creating state on first use.
    pub fn get_thread_id(&self, session_key: &str) -> String {
        {
            let sessions = self.sessions.read();
            if let Some(entry) = sessions.get(session_key) {
                return thread_id(session_key, &entry.state.conversation_id);
            }
        }

        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| new_entry(Utc::now()));
        thread_id(session_key, &entry.state.conversation_id)
    }

    /// Current state, or `None` if the session has never been seen.
    pub fn get_state(&self, session_key: &str) -> Option<SessionState> {
        self.sessions.read().get(session_key).map(|e| e.state.clone())
    }

    /// Rotate the conversation; returns the prior conversation id so the
    /// caller can archive it. Creates the session if needed (in which case
    /// the returned id is the freshly minted first conversation).
    pub fn new_conversation(&self, session_key: &str) -> String {
        let mut sessions = self.sessions.write();
        let now = Utc::now();

        match sessions.get_mut(session_key) {
            Some(entry) => {
                let old_id = entry.state.conversation_id.clone();
                // Never reuse a past value: step past the previous timestamp
                // when the clock has not advanced.
                let ts = if now > entry.conversation_ts {
                    now
                } else {
                    entry.conversation_ts + Duration::microseconds(1)
                };
                entry.conversation_ts = ts;
                entry.state = SessionState {
                    conversation_id: conversation_id(ts),
                    started_at: ts,
                    message_count: 0,
                };
                entry.seed = None;
                wr_domain::TraceEvent::SessionRotated {
                    session_key: session_key.to_owned(),
                    old_conversation_id: old_id.clone(),
                    new_conversation_id: entry.state.conversation_id.clone(),
                }
                .emit();
                old_id
            }
            None => {
                let entry = new_entry(now);
                let id = entry.state.conversation_id.clone();
                sessions.insert(session_key.to_owned(), entry);
                id
            }
        }
    }

    /// Bump the session's message count.
    pub fn increment(&self, session_key: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_key) {
            entry.state.message_count += 1;
        }
    }

    /// Stash content to prepend to the next dispatch on this session.
    pub fn set_seed(&self, session_key: &str, seed: String) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_key) {
            entry.seed = Some(seed);
        }
    }

    /// Take (and clear) the pending seed, if any.
    pub fn take_seed(&self, session_key: &str) -> Option<String> {
        let mut sessions = self.sessions.write();
        sessions.get_mut(session_key).and_then(|e| e.seed.take())
    }

    /// Number of sessions seen so far.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

fn new_entry(ts: DateTime<Utc>) -> SessionEntry {
    SessionEntry {
        state: SessionState {
            conversation_id: conversation_id(ts),
            started_at: ts,
            message_count: 0,
        },
        conversation_ts: ts,
        seed: None,
    }
}

/// Format: `conv_{YYYY-MM-DDTHH-MM-SS-ffffff}` (UTC, microseconds).
pub fn conversation_id(ts: DateTime<Utc>) -> String {
    format!("conv_{}", ts.format("%Y-%m-%dT%H-%M-%S-%6f"))
}

/// `thread_id = "{session_key}:{conversation_id}"`.
pub fn thread_id(session_key: &str, conversation_id: &str) -> String {
    format!("{session_key}:{conversation_id}")
}
