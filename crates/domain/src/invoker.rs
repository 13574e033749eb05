//! The invoker contract — the sole adapter between the runtime and a model
//! provider.
//!
//! The runtime never talks to a provider directly: it hands an
//! [`InvokeRequest`] to an [`AgentInvoker`] and matches on the returned
//! [`FinishedReason`]. Routine termination (cancellation, timeout) is a
//! variant, not an error — only genuine failures surface as `Err`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::tool::ToolDefinition;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage aggregated across all LLM calls within a single invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InvocationMetrics {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub duration_ms: f64,
    #[serde(default)]
    pub model: String,
    /// Set when the provider reported incomplete usage data.
    #[serde(default)]
    pub is_partial: bool,
}

impl InvocationMetrics {
    /// Fold another invocation's counters into this one.
    pub fn absorb(&mut self, other: &InvocationMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.llm_calls += other.llm_calls;
        self.duration_ms += other.duration_ms;
        self.is_partial |= other.is_partial;
    }

    /// Repair totals when a provider reports input/output but not the sum.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 && (self.input_tokens > 0 || self.output_tokens > 0) {
            self.total_tokens = self.input_tokens + self.output_tokens;
        }
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation request / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedReason {
    Complete,
    Cancelled,
    TimedOut,
    Failed,
}

/// A single stateless model invocation against a thread.
#[derive(Clone)]
pub struct InvokeRequest {
    pub system_prompt: String,
    /// Provider-side conversational unit: `"{session_key}:{conversation_id}"`.
    pub thread_id: String,
    pub user_message: String,
    /// Ordered tool list with stable names; the invoker must not reorder or
    /// coalesce.
    pub tools: Vec<ToolDefinition>,
    pub cancel: CancelToken,
    /// Invoker-internal timeout. Callers that layer their own outer timeout
    /// set this higher (outer + 30 s) so only the outer one fires and the
    /// termination cause stays attributable.
    pub inner_timeout: Option<Duration>,
}

impl InvokeRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        thread_id: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            thread_id: thread_id.into(),
            user_message: user_message.into(),
            tools: Vec::new(),
            cancel: CancelToken::new(),
            inner_timeout: None,
        }
    }
}

/// Result of an invocation. Present even for cancelled/timed-out runs, with
/// whatever partial text and metrics the invoker gathered.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub text: String,
    pub metrics: InvocationMetrics,
    pub finished: FinishedReason,
}

impl InvokeOutcome {
    pub fn is_complete(&self) -> bool {
        self.finished == FinishedReason::Complete
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contracts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateless adapter to a model provider.
///
/// `Err` means the call itself could not be made or failed unrecoverably;
/// cancellation and timeout come back as `Ok` with the matching
/// [`FinishedReason`].
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome>;
}

/// Produces a fresh invoker per use. Sub-agents must never share conversation
/// state, so each spawn builds its own instance.
pub trait InvokerFactory: Send + Sync {
    fn build(&self) -> Arc<dyn AgentInvoker>;
}

impl<F> InvokerFactory for F
where
    F: Fn() -> Arc<dyn AgentInvoker> + Send + Sync,
{
    fn build(&self) -> Arc<dyn AgentInvoker> {
        self()
    }
}
