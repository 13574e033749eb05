//! Persistent per-workspace state: YAML document stores for sub-agents and
//! tasks, and the append-only token usage log.
//!
//! Every store is single-writer (a per-store mutex) with crash-safe writes
//! (temp file → fsync → atomic rename). Corrupted files reset to the default
//! document in memory and never fail initialization; the old file survives
//! on disk until the next successful write replaces it.

pub mod document;
pub mod subagent;
pub mod task;
pub mod usage;

pub use subagent::{SubAgentRequest, SubAgentResult, SubAgentStatus, SubAgentStore};
pub use task::{Task, TaskCounts, TaskPriority, TaskStatus, TaskStore};
pub use usage::{InvocationType, UsageEntry, UsageMeter, UsageReader};
