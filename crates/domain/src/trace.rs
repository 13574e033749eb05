use serde::Serialize;

/// Structured trace events emitted across all Warren crates.
///
/// Events serialize to one JSON object on the `trace_event` field, so log
/// pipelines can filter on `event` without parsing message text.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionRotated {
        session_key: String,
        old_conversation_id: String,
        new_conversation_id: String,
    },
    PromptFileRead {
        filename: String,
        raw_chars: usize,
        cache_hit: bool,
    },
    MessageAdmitted {
        session_key: String,
        mode: String,
        synthetic: bool,
    },
    SubAgentSpawned {
        id: String,
        label: String,
        active: usize,
        max_concurrent: usize,
    },
    SubAgentFinished {
        id: String,
        status: String,
        duration_ms: u64,
    },
    CronFired {
        workspace: String,
        cron: String,
        heartbeat: bool,
    },
    StoreCleanup {
        store: String,
        marked_stale: usize,
        removed: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "wr_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_their_variant() {
        let event = TraceEvent::CronFired {
            workspace: "ws".into(),
            cron: "daily".into(),
            heartbeat: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"CronFired\""));
        assert!(json.contains("\"cron\":\"daily\""));
    }

    #[test]
    fn emit_does_not_panic_without_subscriber() {
        TraceEvent::SubAgentFinished {
            id: "x".into(),
            status: "completed".into(),
            duration_ms: 12,
        }
        .emit();
    }
}
