//! Append-only JSONL archive of rotated conversations.
//!
//! Every `/new` or `/compact` rotation appends one record; nothing here is
//! ever rewritten. `/compact` stores the generated summary, `/new` stores
//! `summary: null` with tag `"manual"`.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use wr_domain::{Error, Result};

/// One archived conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub session_key: String,
    pub conversation_id: String,
    pub archived_at: DateTime<Utc>,
    pub message_count: u64,
    pub summary: Option<String>,
    /// `"manual"` for `/new`, `"compact"` for `/compact`.
    pub tag: String,
}

/// Writes archive records to `.warren/archives.jsonl` under the workspace.
pub struct ArchiveWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ArchiveWriter {
    pub fn new(workspace_path: &Path) -> Self {
        Self {
            path: workspace_path.join(".warren").join("archives.jsonl"),
            lock: Mutex::new(()),
        }
    }

    /// Append a record. The line is serialized outside the lock; the lock is
    /// held only for the write.
    pub fn append(&self, record: &ArchiveRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(Error::Io)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::Io)?;
        file.write_all(line.as_bytes()).map_err(Error::Io)?;
        Ok(())
    }

    /// Read back all records, skipping malformed lines.
    pub fn read_all(&self) -> Result<Vec<ArchiveRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(Error::Io)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArchiveRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed archive line");
                }
            }
        }
        Ok(records)
    }
}
