//! Development transport: a console channel and an echo invoker.
//!
//! `warren serve` wires these in when no real channel adapter or provider
//! is configured, so a workspace can be exercised end to end from a
//! terminal: stdin lines become inbound messages for `console:user`,
//! outbound messages print to stdout.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wr_channels::{Channel, InboundMessage};
use wr_domain::invoker::{
    AgentInvoker, FinishedReason, InvocationMetrics, InvokeOutcome, InvokeRequest,
};
use wr_domain::Result;

/// Session key used for all console input.
pub const CONSOLE_SESSION: &str = "console:user";

/// Reads stdin lines, prints outbound messages.
pub struct ConsoleChannel {
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn subscribe(&self, sink: mpsc::Sender<InboundMessage>) -> Result<()> {
        let handle = tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_owned();
                if line.is_empty() {
                    continue;
                }
                if sink
                    .send(InboundMessage::new(CONSOLE_SESSION, line))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    async fn send_message(&self, session_key: &str, content: &str) -> Result<()> {
        println!("[{session_key}] {content}");
        Ok(())
    }

    async fn send_file(
        &self,
        session_key: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<()> {
        println!(
            "[{session_key}] (file) {}{}",
            path.display(),
            caption.map(|c| format!(" — {c}")).unwrap_or_default()
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

/// Development invoker: acknowledges the message without calling a model.
pub struct EchoInvoker {
    model: String,
}

impl EchoInvoker {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome> {
        if request.cancel.is_cancelled() {
            return Ok(InvokeOutcome {
                text: String::new(),
                metrics: InvocationMetrics {
                    model: self.model.clone(),
                    ..Default::default()
                },
                finished: FinishedReason::Cancelled,
            });
        }
        Ok(InvokeOutcome {
            text: format!("[echo:{}] {}", request.thread_id, request.user_message),
            metrics: InvocationMetrics {
                llm_calls: 1,
                model: self.model.clone(),
                ..Default::default()
            },
            finished: FinishedReason::Complete,
        })
    }
}

/// Convenience factory for the echo invoker.
pub fn echo_factory(model: &str) -> Arc<dyn wr_domain::invoker::InvokerFactory> {
    let model = model.to_owned();
    Arc::new(move || Arc::new(EchoInvoker::new(model.clone())) as Arc<dyn AgentInvoker>)
}
