//! Long-running task tracking.
//!
//! Tasks are agent-visible bookkeeping for asynchronous operations, stored
//! in `.warren/tasks.yaml`. `/status` renders the pending / in-progress /
//! completed counts from here.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wr_domain::{Error, Result};

use crate::document;

const STORAGE_FILENAME: &str = "tasks.yaml";
const VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle: `pending → in_progress → completed | failed`, any → `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Category (research, deployment, batch, ...); free-form.
    pub task_type: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Multi-line progress notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            notes: None,
            result_summary: None,
            error_message: None,
        }
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

/// Counts rendered by `/status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document & store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
struct TaskDocument {
    #[serde(default = "d_version")]
    version: u32,
    #[serde(default = "Utc::now")]
    last_updated: DateTime<Utc>,
    #[serde(default)]
    tasks: Vec<Task>,
}

impl Default for TaskDocument {
    fn default() -> Self {
        Self {
            version: VERSION,
            last_updated: Utc::now(),
            tasks: Vec::new(),
        }
    }
}

fn d_version() -> u32 {
    VERSION
}

/// YAML-backed task store with a per-store write mutex.
pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn open(workspace_path: &Path) -> Self {
        let store = Self {
            path: workspace_path.join(".warren").join(STORAGE_FILENAME),
            lock: Mutex::new(()),
        };
        tracing::info!(path = %store.path.display(), "task store ready");
        store
    }

    fn load(&self) -> TaskDocument {
        document::load_or_default(&self.path)
    }

    fn save(&self, doc: &mut TaskDocument) -> Result<()> {
        doc.last_updated = Utc::now();
        document::save_atomic(&self.path, doc)
    }

    pub fn create(&self, task: &Task) -> Result<()> {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        if doc.tasks.iter().any(|t| t.id == task.id) {
            return Err(Error::Validation(format!("task {} already exists", task.id)));
        }
        doc.tasks.push(task.clone());
        self.save(&mut doc)
    }

    pub fn get(&self, id: &Uuid) -> Option<Task> {
        let _guard = self.lock.lock();
        self.load().tasks.into_iter().find(|t| t.id == *id)
    }

    /// List tasks, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let _guard = self.lock.lock();
        let mut tasks: Vec<Task> = self
            .load()
            .tasks
            .into_iter()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Apply a mutation to one task. Returns false when the id is unknown.
    pub fn update<F>(&self, id: &Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let Some(task) = doc.tasks.iter_mut().find(|t| t.id == *id) else {
            tracing::warn!(id = %id, "task not found for update");
            return false;
        };
        f(task);
        if let Err(e) = self.save(&mut doc) {
            tracing::error!(id = %id, error = %e, "failed to persist task update");
            return false;
        }
        true
    }

    pub fn delete(&self, id: &Uuid) -> bool {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let before = doc.tasks.len();
        doc.tasks.retain(|t| t.id != *id);
        if doc.tasks.len() == before {
            return false;
        }
        self.save(&mut doc).is_ok()
    }

    pub fn counts(&self) -> TaskCounts {
        let _guard = self.lock.lock();
        let doc = self.load();
        let mut counts = TaskCounts::default();
        for task in &doc.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                _ => {}
            }
        }
        counts
    }

    /// Mark stale pending/in-progress tasks as failed and prune terminal
    /// tasks older than `max_age_days`. Returns the number pruned.
    pub fn cleanup_old_tasks(&self, max_age_days: u32, stale_threshold_hours: u32) -> usize {
        let _guard = self.lock.lock();
        let mut doc = self.load();
        let now = Utc::now();
        let stale_cutoff = now - Duration::hours(i64::from(stale_threshold_hours));
        let prune_cutoff = now - Duration::days(i64::from(max_age_days));

        let mut marked = 0usize;
        for task in &mut doc.tasks {
            if task.status.is_terminal() || task.created_at >= stale_cutoff {
                continue;
            }
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.append_note(&format!(
                "[auto] Marked failed: stale for >{stale_threshold_hours} hours"
            ));
            marked += 1;
        }

        let before = doc.tasks.len();
        doc.tasks.retain(|t| {
            if !t.status.is_terminal() {
                return true;
            }
            // Prefer completed_at; fall back to created_at for records that
            // never got stamped.
            t.completed_at.unwrap_or(t.created_at) >= prune_cutoff
        });
        let removed = before - doc.tasks.len();

        if marked > 0 || removed > 0 {
            if let Err(e) = self.save(&mut doc) {
                tracing::error!(error = %e, "failed to persist task cleanup");
            }
            wr_domain::TraceEvent::StoreCleanup {
                store: "tasks".into(),
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

    fn store(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::open(dir.path())
    }

    #[test]
    fn create_get_update_delete() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let task = Task::new("research", "Market research");
        s.create(&task).unwrap();

        assert_eq!(s.get(&task.id).unwrap().description, "Market research");

        assert!(s.update(&task.id, |t| {
            t.status = TaskStatus::InProgress;
            t.started_at = Some(Utc::now());
        }));
        assert_eq!(s.get(&task.id).unwrap().status, TaskStatus::InProgress);

        assert!(s.delete(&task.id));
        assert!(s.get(&task.id).is_none());
        assert!(!s.delete(&task.id));
    }

    #[test]
    fn counts_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        for status in [
            TaskStatus::Pending,
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            let mut t = Task::new("t", "d");
            t.status = status;
            s.create(&t).unwrap();
        }

        let counts = s.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.completed, 1);
    }

    #[test]
    fn list_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut a = Task::new("t", "a");
        a.status = TaskStatus::InProgress;
        s.create(&a).unwrap();
        s.create(&Task::new("t", "b")).unwrap();

        let in_progress = s.list(Some(TaskStatus::InProgress));
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].description, "a");
        assert_eq!(s.list(None).len(), 2);
    }

    #[test]
    fn cleanup_marks_stale_with_note() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut stale = Task::new("t", "stale");
        stale.created_at = Utc::now() - Duration::hours(72);
        stale.status = TaskStatus::InProgress;
        s.create(&stale).unwrap();

        s.cleanup_old_tasks(7, 48);

        let updated = s.get(&stale.id).unwrap();
        assert_eq!(updated.status, TaskStatus::Failed);
        assert!(updated
            .notes
            .unwrap()
            .contains("[auto] Marked failed: stale for >48 hours"));
    }

    #[test]
    fn cleanup_prunes_with_created_at_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let mut old = Task::new("t", "old");
        old.created_at = Utc::now() - Duration::days(5);
        old.status = TaskStatus::Completed;
        s.create(&old).unwrap();

        let mut recent = Task::new("t", "recent");
        recent.created_at = Utc::now() - Duration::days(1);
        recent.status = TaskStatus::Completed;
        s.create(&recent).unwrap();

        let removed = s.cleanup_old_tasks(3, 48);
        assert_eq!(removed, 1);
        assert!(s.get(&old.id).is_none());
        assert!(s.get(&recent.id).is_some());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut stale = Task::new("t", "stale");
        stale.created_at = Utc::now() - Duration::hours(72);
        stale.status = TaskStatus::Pending;
        s.create(&stale).unwrap();

        s.cleanup_old_tasks(7, 48);
        let first = s.get(&stale.id).unwrap();
        s.cleanup_old_tasks(7, 48);
        let second = s.get(&stale.id).unwrap();
        assert_eq!(first, second);
    }
}
