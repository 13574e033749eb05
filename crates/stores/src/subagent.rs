//! Sub-agent request/result persistence.
//!
//! State lives in `.warren/subagents.yaml` under the workspace:
//! `{ version, last_updated, requests, results }`. The file is the source of
//! truth; every operation loads, mutates, and atomically rewrites it under
//! the store mutex.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wr_domain::{Error, Result};

use crate::document;

/// Result outputs above this many characters are truncated with a marker.
pub const MAX_RESULT_CHARS: usize = 50_000;

const STORAGE_FILENAME: &str = "subagents.yaml";
const VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sub-agent lifecycle:
/// `pending → running → completed | failed`, any → `cancelled`,
/// stale pending/running → `timed_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SubAgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

/// A spawn request, persisted the moment it is admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentRequest {
    pub id: Uuid,
    /// Session the result notification routes back to (`channel:id`).
    pub parent_session_key: String,
    pub task: String,
    pub label: String,
    pub status: SubAgentStatus,
    pub timeout_minutes: u32,
    pub notify: bool,
    /// Whitelist of tool names / `group:<name>` entries. `None` = full set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_tools: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SubAgentRequest {
    pub fn new(
        task: impl Into<String>,
        label: impl Into<String>,
        parent_session_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_session_key: parent_session_key.into(),
            task: task.into(),
            label: label.into(),
            status: SubAgentStatus::Pending,
            timeout_minutes: 30,
            notify: true,
            allowed_tools: None,
            denied_tools: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            notes: None,
        }
    }

    pub fn with_timeout(mut self, minutes: u32) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    fn append_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(notes) => {
                notes.push('\n');
                notes.push_str(note);
            }
            None => self.notes = Some(note.to_owned()),
        }
    }
}

/// Execution result, persisted alongside the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub request_id: Uuid,
    pub output: String,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
struct SubAgentDocument {
    #[serde(default = "d_version")]
    version: u32,
    #[serde(default = "Utc::now")]
    last_updated: DateTime<Utc>,
    #[serde(default)]
    requests: Vec<SubAgentRequest>,
    #[serde(default)]
    results: Vec<SubAgentResult>,
}

impl Default for SubAgentDocument {
    fn default() -> Self {
        Self {
            version: VERSION,
            last_updated: Utc::now(),
            requests: Vec::new(),
            results: Vec::new(),
        }
    }
}

fn d_version() -> u32 {
    VERSION
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// YAML-backed sub-agent state with a per-store write mutex.
pub struct SubAgentStore {
    path: PathBuf,
    max_age_hours: u32,
    lock: Mutex<()>,
}

impl SubAgentStore {
    /// Open (or create) the store and run the stale-cleanup pass.
    /// Never fails on a corrupt file.
    pub fn open(workspace_path: &Path, max_age_hours: u32) -> Self {
        let store = Self {
            path: workspace_path.join(".warren").join(STORAGE_FILENAME),
            max_age_hours,
            lock: Mutex::new(()),
        };
        store.cleanup_stale();
        tracing::info!(path = %store.path.display(), "sub-agent store ready");
        store
    }

    fn load(&self) -> SubAgentDocument {
        document::load_or_default(&self.path)
    }

    fn save(&self, doc: &mut SubAgentDocument) -> Result<()> {
        doc.last_updated = Utc::now();
        document::save_atomic(&self.path, doc)
    }

    /// Persist a new request. Fails if the id already exists.
    pub fn create(&self, request: &SubAgentRequest) -> Result<()> {
        let _guard = self.lock.lock();
        let mut doc = self.load();

        if doc.requests.iter().any(|r| r.id == request.id) {
            return Err(Error::Validation(format!(
                "sub-agent request {} already exists",
                request.id
            )));
        }

        doc.requests.push(request.clone());
        self.save(&mut doc)?;
        tracing::info!(id = %request.id, label = %request.label, "sub-agent request created");
        Ok(())
    }

    /// Transition a request's status, stamping `started_at` / `completed_at`
    /// as appropriate. Returns false when the id is unknown.
    pub fn update_status(&self, id: &Uuid, status: SubAgentStatus) -> bool {
        let _guard = self.lock.lock();
        let mut doc = self.load();

        let Some(request) = doc.requests.iter_mut().find(|r| r.id == *id) else {
            tracing::warn!(id = %id, "sub-agent request not found for update");
            return false;
        };

        request.status = status;
        let now = Utc::now();
        if status == SubAgentStatus::Running && request.started_at.is_none() {
            request.started_at = Some(now);
        }
        if status.is_terminal() && request.completed_at.is_none() {
            request.completed_at = Some(now);
        }

        if let Err(e) = self.save(&mut doc) {
            tracing::error!(id = %id, error = %e, "failed to persist status update");
            return false;
        }
        true
    }

    /// Save (or replace) a result, truncating oversized output. Returns
    /// false when no request with the matching id exists.
    pub fn save_result(&self, mut result: SubAgentResult) -> bool {
        let _guard = self.lock.lock();
        let mut doc = self.load();

        if !doc.requests.iter().any(|r| r.id == result.request_id) {
            tracing::warn!(
                request_id = %result.request_id,
                "cannot save result: request not found"
            );
            return false;
        }

        if result.output.chars().count() > MAX_RESULT_CHARS {
            tracing::warn!(
                request_id = %result.request_id,
                chars = result.output.chars().count(),
                "truncating oversized sub-agent output"
            );
            let mut truncated: String = result.output.chars().take(MAX_RESULT_CHARS).collect();
            truncated.push_str("\n\n[Output truncated]");
            result.output = truncated;
        }

        doc.results.retain(|r| r.request_id != result.request_id);
        doc.results.push(result);

        if let Err(e) = self.save(&mut doc) {
            tracing::error!(error = %e, "failed to persist sub-agent result");
            return false;
        }
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<SubAgentRequest> {
        let _guard = self.lock.lock();
        self.load().requests.into_iter().find(|r| r.id == *id)
    }

    pub fn get_result(&self, id: &Uuid) -> Option<SubAgentResult> {
        let _guard = self.lock.lock();
        self.load().results.into_iter().find(|r| r.request_id == *id)
    }

    /// Pending or running requests.
    pub fn list_active(&self) -> Vec<SubAgentRequest> {
        let _guard = self.lock.lock();
        self.load()
            .requests
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect()
    }

    /// All requests, most recent first, capped at `limit`.
    pub fn list_recent(&self, limit: usize) -> Vec<SubAgentRequest> {
        let _guard = self.lock.lock();
        let mut requests = self.load().requests;
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        requests.truncate(limit);
        requests
    }

    /// Mark stale pending/running requests as timed out, prune terminal
    /// records older than `max_age_hours`, and drop orphaned results.
    /// Returns the number of pruned requests. Idempotent.
    pub fn cleanup_stale(&self) -> usize {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let now = Utc::now();
        let cutoff = now - Duration::hours(i64::from(self.max_age_hours));

        // Stale transition happens before any pruning, so a request that is
        // both stale and ancient still records its timeout.
        let mut marked = 0usize;
        for request in &mut doc.requests {
            if !request.status.is_active() {
                continue;
            }
            let deadline = request.created_at + Duration::minutes(i64::from(request.timeout_minutes));
            if now > deadline {
                request.status = SubAgentStatus::TimedOut;
                request.completed_at = Some(now);
                let hours = (request.timeout_minutes + 59) / 60;
                request.append_note(&format!("[auto] Marked failed: stale for >{hours}h"));
                marked += 1;
                tracing::info!(id = %request.id, "marked stale sub-agent as timed_out");
            }
        }

        let before = doc.requests.len();
        doc.requests.retain(|r| {
            !r.status.is_terminal() || r.completed_at.map_or(true, |t| t >= cutoff)
        });
        let removed = before - doc.requests.len();

        // Referential integrity: results without a surviving request go too.
        let ids: std::collections::HashSet<Uuid> = doc.requests.iter().map(|r| r.id).collect();
        doc.results.retain(|r| ids.contains(&r.request_id));

        if marked > 0 || removed > 0 {
            if let Err(e) = self.save(&mut doc) {
                tracing::error!(error = %e, "failed to persist cleanup");
            }
            wr_domain::TraceEvent::StoreCleanup {
                store: "subagents".into(),
                marked_stale: marked,
                removed,
            }
            .emit();
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SubAgentStore {
        SubAgentStore::open(dir.path(), 24)
    }

    #[test]
    fn create_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let req = SubAgentRequest::new("research X", "research-x", "telegram:1");
        s.create(&req).unwrap();

        let fetched = s.get(&req.id).unwrap();
        assert_eq!(fetched, req);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let req = SubAgentRequest::new("t", "l", "telegram:1");
        s.create(&req).unwrap();
        assert!(matches!(s.create(&req), Err(Error::Validation(_))));
    }

    #[test]
    fn status_transitions_stamp_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let req = SubAgentRequest::new("t", "l", "telegram:1");
        s.create(&req).unwrap();

        assert!(s.update_status(&req.id, SubAgentStatus::Running));
        let running = s.get(&req.id).unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        assert!(s.update_status(&req.id, SubAgentStatus::Completed));
        let done = s.get(&req.id).unwrap();
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn update_unknown_id_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        assert!(!s.update_status(&Uuid::new_v4(), SubAgentStatus::Running));
    }

    #[test]
    fn result_requires_matching_request() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let orphan = SubAgentResult {
            request_id: Uuid::new_v4(),
            output: "x".into(),
            token_count: 0,
            duration_ms: 0.0,
            error: None,
        };
        assert!(!s.save_result(orphan));
    }

    #[test]
    fn oversized_output_is_truncated_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let req = SubAgentRequest::new("t", "l", "telegram:1");
        s.create(&req).unwrap();

        let result = SubAgentResult {
            request_id: req.id,
            output: "x".repeat(MAX_RESULT_CHARS + 500),
            token_count: 10,
            duration_ms: 5.0,
            error: None,
        };
        assert!(s.save_result(result));

        let saved = s.get_result(&req.id).unwrap();
        assert!(saved.output.ends_with("[Output truncated]"));
        assert!(saved.output.chars().count() < MAX_RESULT_CHARS + 100);
    }

    #[test]
    fn save_result_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let req = SubAgentRequest::new("t", "l", "telegram:1");
        s.create(&req).unwrap();

        for output in ["first", "second"] {
            s.save_result(SubAgentResult {
                request_id: req.id,
                output: output.into(),
                token_count: 0,
                duration_ms: 0.0,
                error: None,
            });
        }
        assert_eq!(s.get_result(&req.id).unwrap().output, "second");
    }

    #[test]
    fn list_active_filters_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let a = SubAgentRequest::new("a", "a", "telegram:1");
        let b = SubAgentRequest::new("b", "b", "telegram:1");
        s.create(&a).unwrap();
        s.create(&b).unwrap();
        s.update_status(&a.id, SubAgentStatus::Running);
        s.update_status(&b.id, SubAgentStatus::Completed);

        let active = s.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);
    }

    #[test]
    fn list_recent_sorts_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut req = SubAgentRequest::new(format!("t{i}"), format!("l{i}"), "telegram:1");
            req.created_at = Utc::now() - Duration::minutes(10 - i);
            s.create(&req).unwrap();
            ids.push(req.id);
        }

        let recent = s.list_recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, ids[4]);
        assert_eq!(recent[1].id, ids[3]);
    }

    #[test]
    fn serde_round_trip_preserves_record() {
        let mut req = SubAgentRequest::new("task", "label", "telegram:1")
            .with_timeout(60)
            .with_notify(false);
        req.allowed_tools = Some(vec!["group:web".into(), "read_file".into()]);
        req.notes = Some("a note".into());

        let yaml = serde_yaml::to_string(&req).unwrap();
        let back: SubAgentRequest = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn cleanup_marks_stale_and_prunes_old() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        // Stale running request: created 2h ago with a 30-minute timeout.
        let mut stale = SubAgentRequest::new("stale", "stale", "telegram:1");
        stale.created_at = Utc::now() - Duration::hours(2);
        stale.status = SubAgentStatus::Running;
        s.create(&stale).unwrap();

        // Ancient completed request: pruned.
        let mut old = SubAgentRequest::new("old", "old", "telegram:1");
        old.created_at = Utc::now() - Duration::hours(50);
        old.status = SubAgentStatus::Completed;
        old.completed_at = Some(Utc::now() - Duration::hours(48));
        s.create(&old).unwrap();
        s.save_result(SubAgentResult {
            request_id: old.id,
            output: "done".into(),
            token_count: 0,
            duration_ms: 0.0,
            error: None,
        });

        let removed = s.cleanup_stale();
        assert_eq!(removed, 1);

        let marked = s.get(&stale.id).unwrap();
        assert_eq!(marked.status, SubAgentStatus::TimedOut);
        assert!(marked.completed_at.is_some());
        assert!(marked.notes.unwrap().contains("[auto] Marked failed: stale"));

        // Pruned request and its orphaned result are both gone.
        assert!(s.get(&old.id).is_none());
        assert!(s.get_result(&old.id).is_none());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let mut stale = SubAgentRequest::new("stale", "stale", "telegram:1");
        stale.created_at = Utc::now() - Duration::hours(2);
        stale.status = SubAgentStatus::Running;
        s.create(&stale).unwrap();

        s.cleanup_stale();
        let first = s.get(&stale.id).unwrap();
        s.cleanup_stale();
        let second = s.get(&stale.id).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn open_on_corrupt_file_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let warren = dir.path().join(".warren");
        std::fs::create_dir_all(&warren).unwrap();
        std::fs::write(warren.join(STORAGE_FILENAME), ":: not yaml ::").unwrap();

        let s = store(&dir);
        assert!(s.list_recent(10).is_empty());
    }
}
