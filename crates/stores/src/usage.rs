//! Token usage metering.
//!
//! Every invocation appends one JSON line to `.warren/token_usage.jsonl`.
//! The line is built outside the lock; the lock is held only for the append.
//! The reader aggregates by calendar day in the workspace timezone.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use wr_domain::invoker::InvocationMetrics;

const LOG_FILENAME: &str = "token_usage.jsonl";

/// What drove an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationType {
    User,
    Cron,
    Heartbeat,
    Subagent,
}

/// One line of the usage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: DateTime<Utc>,
    pub workspace: String,
    pub invocation_type: InvocationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub llm_calls: u64,
    pub duration_ms: f64,
    pub model: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only usage logger. Logging failures are warnings, never errors —
/// metering must not take down a dispatch.
pub struct UsageMeter {
    path: PathBuf,
    workspace: String,
    lock: Mutex<()>,
}

impl UsageMeter {
    pub fn new(workspace_path: &Path, workspace: impl Into<String>) -> Self {
        Self {
            path: workspace_path.join(".warren").join(LOG_FILENAME),
            workspace: workspace.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn log(
        &self,
        metrics: &InvocationMetrics,
        invocation_type: InvocationType,
        session_key: Option<&str>,
    ) {
        let entry = UsageEntry {
            timestamp: Utc::now(),
            workspace: self.workspace.clone(),
            invocation_type,
            session_key: session_key.map(Into::into),
            input_tokens: metrics.input_tokens,
            output_tokens: metrics.output_tokens,
            total_tokens: metrics.total_tokens,
            llm_calls: metrics.llm_calls,
            duration_ms: metrics.duration_ms,
            model: metrics.model.clone(),
        };

        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize usage entry");
                return;
            }
        };
        line.push('\n');

        let _guard = self.lock.lock();
        let result = self
            .path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
            })
            .and_then(|mut f| f.write_all(line.as_bytes()));

        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to log token usage");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reader
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Aggregates the usage log. Skips malformed lines.
pub struct UsageReader {
    path: PathBuf,
}

impl UsageReader {
    pub fn new(workspace_path: &Path) -> Self {
        Self {
            path: workspace_path.join(".warren").join(LOG_FILENAME),
        }
    }

    /// Aggregate all entries from today in the given timezone.
    pub fn tokens_today(&self, timezone: &str) -> InvocationMetrics {
        self.aggregate(timezone, None)
    }

    /// Aggregate today's entries for one session.
    pub fn tokens_for_session(&self, session_key: &str, timezone: &str) -> InvocationMetrics {
        self.aggregate(timezone, Some(session_key))
    }

    fn aggregate(&self, timezone: &str, session_key: Option<&str>) -> InvocationMetrics {
        let tz: chrono_tz::Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        let today = Utc::now().with_timezone(&tz).date_naive();

        let mut aggregated = InvocationMetrics::default();
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return aggregated,
        };

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: UsageEntry = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed usage line");
                    continue;
                }
            };
            if entry.timestamp.with_timezone(&tz).date_naive() != today {
                continue;
            }
            if let Some(sk) = session_key {
                if entry.session_key.as_deref() != Some(sk) {
                    continue;
                }
            }
            aggregated.input_tokens += entry.input_tokens;
            aggregated.output_tokens += entry.output_tokens;
            aggregated.total_tokens += entry.total_tokens;
            aggregated.llm_calls += entry.llm_calls;
            aggregated.duration_ms += entry.duration_ms;
        }

        aggregated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(total: u64) -> InvocationMetrics {
        InvocationMetrics {
            input_tokens: total / 2,
            output_tokens: total - total / 2,
            total_tokens: total,
            llm_calls: 1,
            duration_ms: 10.0,
            model: "test-model".into(),
            is_partial: false,
        }
    }

    #[test]
    fn log_and_aggregate_today() {
        let dir = tempfile::tempdir().unwrap();
        let meter = UsageMeter::new(dir.path(), "ws");
        meter.log(&metrics(100), InvocationType::User, Some("telegram:1"));
        meter.log(&metrics(50), InvocationType::Cron, None);

        let reader = UsageReader::new(dir.path());
        let today = reader.tokens_today("UTC");
        assert_eq!(today.total_tokens, 150);
        assert_eq!(today.llm_calls, 2);
    }

    #[test]
    fn per_session_filter() {
        let dir = tempfile::tempdir().unwrap();
        let meter = UsageMeter::new(dir.path(), "ws");
        meter.log(&metrics(100), InvocationType::User, Some("telegram:1"));
        meter.log(&metrics(70), InvocationType::User, Some("telegram:2"));
        meter.log(&metrics(30), InvocationType::Subagent, Some("telegram:1"));

        let reader = UsageReader::new(dir.path());
        assert_eq!(reader.tokens_for_session("telegram:1", "UTC").total_tokens, 130);
        assert_eq!(reader.tokens_for_session("telegram:2", "UTC").total_tokens, 70);
        assert_eq!(reader.tokens_for_session("telegram:3", "UTC").total_tokens, 0);
    }

    #[test]
    fn missing_log_aggregates_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let reader = UsageReader::new(dir.path());
        assert_eq!(reader.tokens_today("UTC"), InvocationMetrics::default());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let meter = UsageMeter::new(dir.path(), "ws");
        meter.log(&metrics(100), InvocationType::User, None);

        let path = dir.path().join(".warren").join(LOG_FILENAME);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("oops not json\n");
        std::fs::write(&path, raw).unwrap();
        meter.log(&metrics(10), InvocationType::Heartbeat, None);

        let reader = UsageReader::new(dir.path());
        assert_eq!(reader.tokens_today("UTC").total_tokens, 110);
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let dir = tempfile::tempdir().unwrap();
        let meter = UsageMeter::new(dir.path(), "ws");
        meter.log(&metrics(42), InvocationType::User, None);

        let reader = UsageReader::new(dir.path());
        assert_eq!(reader.tokens_today("Not/Real").total_tokens, 42);
    }

    #[test]
    fn invocation_type_snake_case() {
        assert_eq!(
            serde_json::to_string(&InvocationType::Subagent).unwrap(),
            "\"subagent\""
        );
        assert_eq!(
            serde_json::to_string(&InvocationType::Heartbeat).unwrap(),
            "\"heartbeat\""
        );
    }
}
