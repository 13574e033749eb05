//! Sub-agent lifecycle: semaphore-gated background executions with
//! per-spawn tool filtering, an outer timeout, cooperative cancellation,
//! and result delivery back into the parent session.
//!
//! Admission fails fast at capacity (nothing is queued and nothing is
//! persisted for a rejected spawn). Admitted requests flow through the
//! sub-agent lane; the lane worker body delegates to [`SubAgentRunner::execute`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use wr_channels::Channel;
use wr_domain::config::clamp_timeout_minutes;
use wr_domain::invoker::{FinishedReason, InvokeRequest, InvokerFactory};
use wr_domain::tool::{ToolCatalog, ToolDefinition};
use wr_domain::{CancelToken, Error, Result, TraceEvent};
use wr_stores::subagent::{SubAgentRequest, SubAgentResult, SubAgentStatus, SubAgentStore};
use wr_stores::usage::{InvocationType, UsageMeter};

use crate::lanes::{Lane, LaneItem, LanePayload, LaneQueue};

/// Tools never exposed to sub-agents, regardless of the allow list: no
/// recursion, no self-continuation, no unsolicited user messaging, no
/// persistence that outlives the sub-agent.
pub const SUBAGENT_EXCLUDED_TOOLS: &[&str] = &[
    "spawn_agent",
    "list_subagents",
    "get_subagent_result",
    "cancel_subagent",
    "request_followup",
    "send_message",
    "send_file",
    "schedule_at",
    "schedule_every",
    "list_scheduled",
    "cancel_scheduled",
];

/// `(parent_session_key, content)` — re-enters the parent's main lane as a
/// synthetic message.
pub type ResultSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Produces the system prompt for a sub-agent invocation.
pub type SystemPromptFn = Arc<dyn Fn() -> String + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool filtering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compute the effective tool set for one spawn.
///
/// Start from the full catalog; restrict to `allowed` when present, then
/// subtract `denied` (both accept bare names or `group:<name>`), and always
/// remove [`SUBAGENT_EXCLUDED_TOOLS`]. Unknown names are warnings, never
/// errors. Catalog order is preserved.
pub fn effective_tools(
    catalog: &dyn ToolCatalog,
    allowed: Option<&[String]>,
    denied: Option<&[String]>,
) -> Vec<ToolDefinition> {
    let mut tools = catalog.all();
    let known: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();

    let expand = |entries: &[String], which: &str| -> HashSet<String> {
        let mut set = HashSet::new();
        for entry in entries {
            if let Some(group) = entry.strip_prefix("group:") {
                match catalog.resolve_group(group) {
                    Some(members) => set.extend(members),
                    None => {
                        tracing::warn!(group = group, list = which, "unknown tool group, ignoring");
                    }
                }
            } else if known.contains(entry) {
                set.insert(entry.clone());
            } else {
                tracing::warn!(tool = %entry, list = which, "unknown tool name, ignoring");
            }
        }
        set
    };

    if let Some(allowed) = allowed {
        let allow = expand(allowed, "allowed");
        tools.retain(|t| allow.contains(&t.name));
    }
    if let Some(denied) = denied {
        let deny = expand(denied, "denied");
        tools.retain(|t| !deny.contains(&t.name));
    }
    tools.retain(|t| !SUBAGENT_EXCLUDED_TOOLS.contains(&t.name.as_str()));
    tools
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Notification formatting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const NOTIFICATION_EXCERPT_CHARS: usize = 500;

/// Build the `[SYSTEM]` completion notice for the parent session.
pub fn format_notification(request: &SubAgentRequest, result: &SubAgentResult) -> String {
    if let Some(error) = &result.error {
        if error.to_lowercase().contains("timed out") {
            return format!(
                "[SYSTEM] Sub-agent '{}' timed out after {} minutes.",
                request.label, request.timeout_minutes
            );
        }
        return format!(
            "[SYSTEM] Sub-agent '{}' failed.\nError: {error}",
            request.label
        );
    }

    if result.output.chars().count() > NOTIFICATION_EXCERPT_CHARS {
        let excerpt: String = result.output.chars().take(NOTIFICATION_EXCERPT_CHARS).collect();
        format!(
            "[SYSTEM] Sub-agent '{}' completed.\n\n{excerpt}\n\n\
             Use get_subagent_result(id=\"{}\") to read the full output.",
            request.label, request.id
        )
    } else {
        format!(
            "[SYSTEM] Sub-agent '{}' completed.\n\n{}",
            request.label, result.output
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SubAgentRunner {
    factory: Arc<dyn InvokerFactory>,
    catalog: Arc<dyn ToolCatalog>,
    store: Arc<SubAgentStore>,
    meter: Arc<UsageMeter>,
    lanes: Arc<LaneQueue>,
    system_prompt: SystemPromptFn,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    result_sink: Option<ResultSink>,
    channel: Option<Arc<dyn Channel>>,
    /// Cancel tokens for admitted (queued or running) requests.
    active: Mutex<HashMap<Uuid, CancelToken>>,
    drained: Notify,
}

impl SubAgentRunner {
    pub fn new(
        factory: Arc<dyn InvokerFactory>,
        catalog: Arc<dyn ToolCatalog>,
        store: Arc<SubAgentStore>,
        meter: Arc<UsageMeter>,
        lanes: Arc<LaneQueue>,
        system_prompt: SystemPromptFn,
        max_concurrent: usize,
    ) -> Self {
        Self {
            factory,
            catalog,
            store,
            meter,
            lanes,
            system_prompt,
            max_concurrent: max_concurrent.max(1),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            result_sink: None,
            channel: None,
            active: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        }
    }

    /// Preferred result delivery: queue injection into the parent session.
    pub fn with_result_sink(mut self, sink: ResultSink) -> Self {
        self.result_sink = Some(sink);
        self
    }

    /// Fallback result delivery: direct channel send.
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Admit a spawn. Fails fast with `Capacity` when `max_concurrent`
    /// requests are already admitted — nothing is persisted in that case.
    pub fn spawn(&self, mut request: SubAgentRequest) -> Result<Uuid> {
        request.timeout_minutes = clamp_timeout_minutes(request.timeout_minutes);

        {
            let mut active = self.active.lock();
            if active.len() >= self.max_concurrent {
                return Err(Error::Capacity(format!(
                    "cannot spawn sub-agent: max concurrent limit reached ({})",
                    self.max_concurrent
                )));
            }
            active.insert(request.id, CancelToken::new());
        }

        if let Err(e) = self.store.create(&request) {
            self.forget(&request.id);
            return Err(e);
        }

        let item = LaneItem {
            lane: Lane::Subagent,
            session_key: request.parent_session_key.clone(),
            payload: LanePayload::SubAgent {
                request_id: request.id,
            },
            enqueue_ts: chrono::Utc::now(),
            bypass_debounce: false,
        };
        match self.lanes.enqueue(item) {
            Ok(Some(evicted)) => self.discard_evicted(evicted),
            Ok(None) => {}
            Err(e) => {
                self.forget(&request.id);
                self.store.update_status(&request.id, SubAgentStatus::Failed);
                return Err(e);
            }
        }

        TraceEvent::SubAgentSpawned {
            id: request.id.to_string(),
            label: request.label.clone(),
            active: self.active_count(),
            max_concurrent: self.max_concurrent,
        }
        .emit();
        Ok(request.id)
    }

    /// Cooperatively cancel an admitted sub-agent. Returns false when the id
    /// is not active.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let token = self.active.lock().get(id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                self.store.update_status(id, SubAgentStatus::Cancelled);
                tracing::info!(id = %id, "cancelled sub-agent");
                true
            }
            None => {
                tracing::warn!(id = %id, "cannot cancel: sub-agent not active");
                false
            }
        }
    }

    pub fn list_active(&self) -> Vec<SubAgentRequest> {
        self.store.list_active()
    }

    pub fn list_recent(&self, limit: usize) -> Vec<SubAgentRequest> {
        self.store.list_recent(limit)
    }

    pub fn get_status(&self, id: &Uuid) -> Option<SubAgentRequest> {
        self.store.get(id)
    }

    pub fn get_result(&self, id: &Uuid) -> Option<SubAgentResult> {
        self.store.get_result(id)
    }

    /// Cancel everything and wait up to 5 s for in-flight executions to
    /// finish. Best-effort.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.active.lock().keys().copied().collect();
        if ids.is_empty() {
            tracing::info!("no active sub-agents to shut down");
            return;
        }

        tracing::info!(count = ids.len(), "shutting down active sub-agents");
        for id in &ids {
            self.cancel(id);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.active_count() > 0 && Instant::now() < deadline {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.drained.notified()).await;
        }
        if self.active_count() > 0 {
            tracing::warn!("some sub-agents did not shut down cleanly within 5s");
        }
    }

    /// Run one admitted request to a terminal state. Called by the sub-agent
    /// lane worker.
    pub async fn execute(&self, request_id: Uuid) {
        let Some(request) = self.store.get(&request_id) else {
            tracing::warn!(id = %request_id, "sub-agent request vanished before execution");
            self.forget(&request_id);
            return;
        };
        if request.status.is_terminal() {
            // Cancelled while still queued.
            self.forget(&request_id);
            return;
        }

        let token = self
            .active
            .lock()
            .get(&request_id)
            .cloned()
            .unwrap_or_default();

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("sub-agent semaphore never closed");

        let start = Instant::now();
        self.store.update_status(&request_id, SubAgentStatus::Running);
        tracing::info!(id = %request_id, label = %request.label, "executing sub-agent");

        // Fresh invoker per spawn: no shared conversation state.
        let invoker = self.factory.build();
        let tools = effective_tools(
            self.catalog.as_ref(),
            request.allowed_tools.as_deref(),
            request.denied_tools.as_deref(),
        );

        let outer = Duration::from_secs(u64::from(request.timeout_minutes) * 60);
        let invoke_request = InvokeRequest {
            system_prompt: (self.system_prompt)(),
            thread_id: format!("subagent:{request_id}"),
            user_message: request.task.clone(),
            tools,
            cancel: token.clone(),
            // Defer the invoker's own timeout past ours so only the outer
            // timeout fires and the termination cause stays attributable.
            inner_timeout: Some(outer + Duration::from_secs(30)),
        };

        let invocation = tokio::time::timeout(outer, invoker.invoke(invoke_request)).await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        match invocation {
            Err(_elapsed) => {
                token.cancel();
                self.store.update_status(&request_id, SubAgentStatus::TimedOut);
                let result = SubAgentResult {
                    request_id,
                    output: String::new(),
                    token_count: 0,
                    duration_ms,
                    error: Some(format!(
                        "Sub-agent timed out after {} minutes",
                        request.timeout_minutes
                    )),
                };
                self.store.save_result(result.clone());
                tracing::warn!(id = %request_id, "sub-agent timed out");
                if request.notify {
                    self.send_notification(&request, &result).await;
                }
            }
            Ok(Ok(outcome)) => match outcome.finished {
                FinishedReason::Complete => {
                    let metrics = outcome.metrics.normalized();
                    let result = SubAgentResult {
                        request_id,
                        output: outcome.text,
                        token_count: metrics.total_tokens,
                        duration_ms,
                        error: None,
                    };
                    self.store.save_result(result.clone());
                    self.store
                        .update_status(&request_id, SubAgentStatus::Completed);
                    tracing::info!(
                        id = %request_id,
                        duration_ms = duration_ms as u64,
                        tokens = metrics.total_tokens,
                        "sub-agent completed"
                    );
                    if request.notify {
                        self.send_notification(&request, &result).await;
                    }
                    self.meter.log(
                        &metrics,
                        InvocationType::Subagent,
                        Some(&request.parent_session_key),
                    );
                }
                FinishedReason::Cancelled => {
                    // No notification on cancellation: the parent asked for
                    // the stop, there is nothing to report.
                    self.store
                        .update_status(&request_id, SubAgentStatus::Cancelled);
                    self.store.save_result(SubAgentResult {
                        request_id,
                        output: String::new(),
                        token_count: 0,
                        duration_ms,
                        error: Some("Sub-agent was cancelled".into()),
                    });
                    tracing::info!(id = %request_id, "sub-agent was cancelled");
                }
                FinishedReason::TimedOut => {
                    self.store.update_status(&request_id, SubAgentStatus::TimedOut);
                    let result = SubAgentResult {
                        request_id,
                        output: String::new(),
                        token_count: 0,
                        duration_ms,
                        error: Some(format!(
                            "Sub-agent timed out after {} minutes",
                            request.timeout_minutes
                        )),
                    };
                    self.store.save_result(result.clone());
                    if request.notify {
                        self.send_notification(&request, &result).await;
                    }
                }
                FinishedReason::Failed => {
                    self.store.update_status(&request_id, SubAgentStatus::Failed);
                    let detail = if outcome.text.is_empty() {
                        "invoker reported failure".to_owned()
                    } else {
                        outcome.text
                    };
                    let result = SubAgentResult {
                        request_id,
                        output: String::new(),
                        token_count: 0,
                        duration_ms,
                        error: Some(format!("Sub-agent failed: {detail}")),
                    };
                    self.store.save_result(result.clone());
                    tracing::error!(id = %request_id, "sub-agent failed");
                    if request.notify {
                        self.send_notification(&request, &result).await;
                    }
                }
            },
            Ok(Err(e)) => {
                self.store.update_status(&request_id, SubAgentStatus::Failed);
                let result = SubAgentResult {
                    request_id,
                    output: String::new(),
                    token_count: 0,
                    duration_ms,
                    error: Some(format!("Sub-agent failed: {e}")),
                };
                self.store.save_result(result.clone());
                tracing::error!(id = %request_id, error = %e, "sub-agent failed");
                if request.notify {
                    self.send_notification(&request, &result).await;
                }
            }
        }

        if let Some(record) = self.store.get(&request_id) {
            TraceEvent::SubAgentFinished {
                id: request_id.to_string(),
                status: record.status.as_str().to_owned(),
                duration_ms: duration_ms as u64,
            }
            .emit();
        }
        self.forget(&request_id);
    }

    fn forget(&self, id: &Uuid) {
        self.active.lock().remove(id);
        self.drained.notify_waiters();
    }

    /// Account for a sub-agent admission evicted by the lane's drop policy.
    fn discard_evicted(&self, item: LaneItem) {
        if let LanePayload::SubAgent { request_id } = item.payload {
            tracing::warn!(id = %request_id, "sub-agent admission dropped by lane policy");
            self.store.update_status(&request_id, SubAgentStatus::Cancelled);
            self.store.save_result(SubAgentResult {
                request_id,
                output: String::new(),
                token_count: 0,
                duration_ms: 0.0,
                error: Some("Dropped from the sub-agent lane at capacity".into()),
            });
            self.forget(&request_id);
        }
    }

    async fn send_notification(&self, request: &SubAgentRequest, result: &SubAgentResult) {
        let content = format_notification(request, result);

        if let Some(sink) = &self.result_sink {
            sink(&request.parent_session_key, &content);
            tracing::debug!(id = %request.id, "queued sub-agent notification");
            return;
        }

        let Some(channel) = &self.channel else {
            tracing::warn!(id = %request.id, "no delivery path for sub-agent notification");
            return;
        };
        if let Err(e) = channel
            .send_message(&request.parent_session_key, &content)
            .await
        {
            tracing::warn!(id = %request.id, error = %e, "failed to send sub-agent notification");
        }
    }
}
