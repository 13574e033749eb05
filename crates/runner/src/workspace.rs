//! The per-workspace runner: composes the session manager, lane queue,
//! queue-mode machine, command router, cron scheduler, and sub-agent runner
//! around one channel and one invoker factory, and drives the dispatch
//! loops.
//!
//! Lifecycle is one-shot: `created → starting → running → stopping →
//! stopped`. Starting twice is an error; stopping a non-running runner is a
//! no-op. Restart means building a fresh runner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use wr_channels::{chunk_text, Channel, InboundMessage};
use wr_domain::config::{valid_workspace_name, QueueMode, WorkspaceConfig};
use wr_domain::invoker::{FinishedReason, InvokeRequest, InvokerFactory};
use wr_domain::tool::ToolCatalog;
use wr_domain::{CancelMap, CancelToken, Error, Result};
use wr_sessions::{ArchiveRecord, ArchiveWriter, SessionManager};
use wr_stores::{
    InvocationType, SubAgentStore, TaskStore, UsageMeter, UsageReader,
};

use crate::commands::CommandRouter;
use crate::lanes::{Lane, LaneItem, LanePayload, LaneQueue};
use crate::locks::SessionLockMap;
use crate::prompt::PromptReader;
use crate::queue_mode::{FlushSink, QueueModeMachine};
use crate::scheduler::{load_definitions, CronScheduler};
use crate::subagent::{ResultSink, SubAgentRunner};

const FAILURE_REPLY: &str = "Something went wrong handling your message. Please try again.";

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
const TASK_MAX_AGE_DAYS: u32 = 7;
const TASK_STALE_HOURS: u32 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub(crate) struct RunnerInner {
    config: WorkspaceConfig,
    channel: Arc<dyn Channel>,
    factory: Arc<dyn InvokerFactory>,
    catalog: Arc<dyn ToolCatalog>,
    sessions: Arc<SessionManager>,
    archive: ArchiveWriter,
    lanes: Arc<LaneQueue>,
    queue_modes: QueueModeMachine,
    router: CommandRouter,
    subagents: Arc<SubAgentRunner>,
    scheduler: Arc<CronScheduler>,
    subagent_store: Arc<SubAgentStore>,
    task_store: Arc<TaskStore>,
    meter: Arc<UsageMeter>,
    usage: UsageReader,
    cancels: Arc<CancelMap>,
    run_locks: Arc<SessionLockMap>,
    prompts: Arc<PromptReader>,
    state: Mutex<RunnerState>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// One workspace's runtime. Exclusively owns all of its sub-components.
#[derive(Clone)]
pub struct WorkspaceRunner {
    inner: Arc<RunnerInner>,
}

impl WorkspaceRunner {
    pub fn new(
        config: WorkspaceConfig,
        channel: Arc<dyn Channel>,
        factory: Arc<dyn InvokerFactory>,
        catalog: Arc<dyn ToolCatalog>,
    ) -> Self {
        let settings = &config.settings;

        let lanes = Arc::new(LaneQueue::new(&settings.lanes));
        let cancels = Arc::new(CancelMap::new());

        // The machine flushes collapsed prompts straight onto the main lane.
        let flush_lanes = lanes.clone();
        let flush_sink: FlushSink = Arc::new(move |session_key, content, synthetic| {
            let mut item = LaneItem::prompt(Lane::Main, session_key, content);
            item.bypass_debounce = synthetic;
            if let Err(e) = flush_lanes.enqueue(item) {
                tracing::warn!(session_key, error = %e, "failed to enqueue main-lane item");
            }
        });
        let queue_modes = QueueModeMachine::new(
            settings.queue_mode,
            Duration::from_millis(settings.debounce_ms),
            cancels.clone(),
            flush_sink,
        );

        let subagent_store = Arc::new(SubAgentStore::open(
            &config.path,
            settings.subagents.max_age_hours,
        ));
        let task_store = Arc::new(TaskStore::open(&config.path));
        let meter = Arc::new(UsageMeter::new(&config.path, config.name.clone()));
        let usage = UsageReader::new(&config.path);
        let prompts = Arc::new(PromptReader::new(config.path.clone()));

        // Sub-agent results re-enter the parent session as synthetic inputs.
        let notify_machine = queue_modes.clone();
        let result_sink: ResultSink = Arc::new(move |session_key: &str, content: &str| {
            notify_machine.on_inbound(session_key, content.to_owned(), true);
        });

        let prompt_reader = prompts.clone();
        let prompt_catalog = catalog.clone();
        let subagents = Arc::new(
            SubAgentRunner::new(
                factory.clone(),
                catalog.clone(),
                subagent_store.clone(),
                meter.clone(),
                lanes.clone(),
                Arc::new(move || prompt_reader.build_system_prompt(prompt_catalog.as_ref())),
                settings.subagents.max_concurrent,
            )
            .with_result_sink(result_sink)
            .with_channel(channel.clone()),
        );

        let scheduler = Arc::new(CronScheduler::new(
            config.name.clone(),
            &settings.timezone,
            lanes.clone(),
        ));

        let archive = ArchiveWriter::new(&config.path);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(RunnerInner {
                config,
                channel,
                factory,
                catalog,
                sessions: Arc::new(SessionManager::new()),
                archive,
                lanes,
                queue_modes,
                router: CommandRouter::with_builtins(),
                subagents,
                scheduler,
                subagent_store,
                task_store,
                meter,
                usage,
                cancels,
                run_locks: Arc::new(SessionLockMap::new()),
                prompts,
                state: Mutex::new(RunnerState::Created),
                shutdown,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> RunnerState {
        *self.inner.state.lock()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.inner.sessions.clone()
    }

    pub fn subagents(&self) -> Arc<SubAgentRunner> {
        self.inner.subagents.clone()
    }

    pub fn lanes(&self) -> Arc<LaneQueue> {
        self.inner.lanes.clone()
    }

    pub fn task_store(&self) -> Arc<TaskStore> {
        self.inner.task_store.clone()
    }

    /// Manually fire a cron job (same semantics as a scheduled tick).
    pub fn trigger_cron(&self, name: &str) -> Result<()> {
        self.inner.scheduler.trigger(name)
    }

    /// Start the runner. One-shot: fails on anything but a fresh runner.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != RunnerState::Created {
                return Err(Error::Validation(format!(
                    "workspace '{}' cannot start from state {:?}",
                    self.name(),
                    *state
                )));
            }
            *state = RunnerState::Starting;
        }

        if let Err(e) = self.start_sequence().await {
            *self.inner.state.lock() = RunnerState::Stopped;
            return Err(e);
        }

        *self.inner.state.lock() = RunnerState::Running;
        tracing::info!(workspace = %self.name(), "workspace runner started");
        Ok(())
    }

    async fn start_sequence(&self) -> Result<()> {
        let inner = &self.inner;

        if !valid_workspace_name(&inner.config.name) {
            return Err(Error::Validation(format!(
                "invalid workspace name '{}'",
                inner.config.name
            )));
        }
        if !inner.config.path.join("AGENT.md").is_file() {
            return Err(Error::Config(format!(
                "workspace '{}' is missing AGENT.md at {}",
                inner.config.name,
                inner.config.path.display()
            )));
        }

        let defs = load_definitions(&inner.config.path);
        inner
            .scheduler
            .rebuild(&defs, inner.config.settings.heartbeat.as_ref());

        let (tx, rx) = mpsc::channel::<InboundMessage>(256);
        inner
            .channel
            .subscribe(tx)
            .await
            .map_err(|e| Error::Channel(format!("subscribe failed: {e}")))?;

        let mut workers = inner.workers.lock();
        workers.push(tokio::spawn(inbound_pump(
            self.inner.clone(),
            rx,
            inner.shutdown.subscribe(),
        )));

        let lane_workers = [
            (Lane::Main, inner.config.settings.lanes.main_concurrency),
            (Lane::Subagent, inner.config.settings.lanes.subagent_concurrency),
            (Lane::Cron, inner.config.settings.lanes.cron_concurrency),
        ];
        for (lane, concurrency) in lane_workers {
            for _ in 0..concurrency {
                workers.push(tokio::spawn(lane_worker(
                    self.inner.clone(),
                    lane,
                    inner.shutdown.subscribe(),
                )));
            }
        }
        workers.push(tokio::spawn(maintenance_loop(
            self.inner.clone(),
            inner.shutdown.subscribe(),
        )));
        drop(workers);

        inner.scheduler.start();
        Ok(())
    }

    /// Stop the runner. Idempotent; errors are logged, never raised.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != RunnerState::Running {
                tracing::debug!(
                    workspace = %self.name(),
                    state = ?*state,
                    "stop on non-running runner is a no-op"
                );
                return;
            }
            *state = RunnerState::Stopping;
        }
        tracing::info!(workspace = %self.name(), "stopping workspace runner");

        // No new cron firings, then no new inbound.
        self.inner.scheduler.stop().await;
        if let Err(e) = self.inner.channel.close().await {
            tracing::warn!(workspace = %self.name(), error = %e, "channel close failed");
        }

        // Let the main lane drain within the grace period.
        let grace = Duration::from_secs(self.inner.config.settings.stop_grace_secs);
        let deadline = Instant::now() + grace;
        while !self.inner.lanes.is_idle(Lane::Main) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.inner.lanes.is_idle(Lane::Main) {
            tracing::warn!(workspace = %self.name(), "main lane did not drain within grace");
        }

        self.inner.subagents.shutdown().await;

        let _ = self.inner.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        *self.inner.state.lock() = RunnerState::Stopped;
        tracing::info!(workspace = %self.name(), "workspace runner stopped");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Maintenance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Periodic housekeeping: the stale/prune pass over both stores (the same
/// pass that runs on init) and the idle-lock sweep.
async fn maintenance_loop(inner: Arc<RunnerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    // Skip the immediate first tick: init already ran the cleanup.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                inner.subagent_store.cleanup_stale();
                inner
                    .task_store
                    .cleanup_old_tasks(TASK_MAX_AGE_DAYS, TASK_STALE_HOURS);
                inner.run_locks.prune_idle();
            }
            _ = shutdown.changed() => break,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn inbound_pump(
    inner: Arc<RunnerInner>,
    mut rx: mpsc::Receiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = rx.recv() => match maybe {
                Some(msg) => handle_inbound(&inner, msg).await,
                None => break,
            },
        }
    }
}

async fn handle_inbound(inner: &Arc<RunnerInner>, mut msg: InboundMessage) {
    let command = inner
        .router
        .parse(&msg.content)
        .map(|p| (p.name.to_owned(), p.args.to_owned()));
    msg.is_command = command.is_some();

    let Some((name, args)) = command else {
        let session_key = msg.session_key;
        inner.queue_modes.on_inbound(&session_key, msg.content, false);
        return;
    };
    let session_key = msg.session_key;

    tracing::info!(session_key = %session_key, command = %name, "command received");

    // Rotation commands wait on the session run lock, which can take as
    // long as the in-flight invocation; run them off the pump so other
    // sessions keep flowing.
    if name == "new" || name == "compact" {
        let inner = inner.clone();
        tokio::spawn(async move {
            let response = handle_command(&inner, &session_key, &name, &args).await;
            send_chunked(&inner, &session_key, &response).await;
        });
        return;
    }

    let response = handle_command(inner, &session_key, &name, &args).await;
    send_chunked(inner, &session_key, &response).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn lane_worker(inner: Arc<RunnerInner>, lane: Lane, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            item = inner.lanes.take(lane) => {
                let session_key = item.session_key.clone();
                if let Err(e) = dispatch(&inner, item).await {
                    tracing::error!(
                        workspace = %inner.config.name,
                        lane = lane.as_str(),
                        session_key = %session_key,
                        error = %e,
                        "dispatch failed"
                    );
                    if lane == Lane::Main {
                        send_chunked(&inner, &session_key, FAILURE_REPLY).await;
                    }
                }
                inner.lanes.release(lane);
            }
        }
    }
}

async fn dispatch(inner: &Arc<RunnerInner>, item: LaneItem) -> Result<()> {
    match item.payload {
        LanePayload::Prompt { content } => {
            dispatch_main(inner, &item.session_key, content).await
        }
        LanePayload::SubAgent { request_id } => {
            inner.subagents.execute(request_id).await;
            Ok(())
        }
        LanePayload::Cron {
            name,
            prompt,
            route,
            heartbeat,
        } => dispatch_cron(inner, &item.session_key, &name, prompt, route, heartbeat).await,
    }
}

async fn dispatch_main(inner: &Arc<RunnerInner>, session_key: &str, content: String) -> Result<()> {
    // One in-flight invocation per session; /new and /compact queue behind
    // the same lock.
    let _permit = inner.run_locks.acquire(session_key).await;
    inner.queue_modes.begin_invocation(session_key);

    let result = run_main_invocation(inner, session_key, content).await;

    inner.cancels.remove(session_key);
    inner.queue_modes.complete_invocation(session_key);
    result
}

async fn run_main_invocation(
    inner: &Arc<RunnerInner>,
    session_key: &str,
    content: String,
) -> Result<()> {
    let thread_id = inner.sessions.get_thread_id(session_key);

    // A pending compaction seed becomes the head of the first message on
    // the new thread.
    let user_message = match inner.sessions.take_seed(session_key) {
        Some(seed) => format!("{seed}\n\n{content}"),
        None => content,
    };

    let request = InvokeRequest {
        system_prompt: inner.prompts.build_system_prompt(inner.catalog.as_ref()),
        thread_id,
        user_message,
        tools: inner.catalog.all(),
        cancel: inner.cancels.register(session_key),
        inner_timeout: None,
    };

    let invocation = inner.factory.build().invoke(request).await;
    inner.sessions.increment(session_key);

    match invocation {
        Ok(outcome) => {
            match outcome.finished {
                FinishedReason::Complete => {
                    if !outcome.text.is_empty() {
                        send_chunked(inner, session_key, &outcome.text).await;
                    }
                }
                FinishedReason::Cancelled => {
                    // Steered away; the replacement message produces the reply.
                    tracing::info!(session_key, "invocation cancelled");
                }
                FinishedReason::TimedOut | FinishedReason::Failed => {
                    tracing::warn!(session_key, finished = ?outcome.finished, "invocation did not complete");
                    send_chunked(inner, session_key, FAILURE_REPLY).await;
                }
            }
            inner.meter.log(
                &outcome.metrics.normalized(),
                InvocationType::User,
                Some(session_key),
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(session_key, error = %e, "invoker error");
            send_chunked(inner, session_key, FAILURE_REPLY).await;
            Ok(())
        }
    }
}

async fn dispatch_cron(
    inner: &Arc<RunnerInner>,
    thread_id: &str,
    name: &str,
    prompt: String,
    route: Option<String>,
    heartbeat: bool,
) -> Result<()> {
    let user_message = if heartbeat {
        inner.prompts.read_file("HEARTBEAT.md").unwrap_or_default()
    } else {
        prompt
    };
    if user_message.trim().is_empty() {
        tracing::debug!(cron = name, "empty prompt, skipping firing");
        return Ok(());
    }

    let request = InvokeRequest {
        system_prompt: inner.prompts.build_system_prompt(inner.catalog.as_ref()),
        thread_id: thread_id.to_owned(),
        user_message,
        tools: inner.catalog.all(),
        cancel: inner.cancels.register(thread_id),
        inner_timeout: None,
    };

    let invocation = inner.factory.build().invoke(request).await;
    inner.cancels.remove(thread_id);

    let invocation_type = if heartbeat {
        InvocationType::Heartbeat
    } else {
        InvocationType::Cron
    };

    match invocation {
        Ok(outcome) => {
            if outcome.is_complete() {
                match &route {
                    Some(target) if !outcome.text.is_empty() => {
                        send_chunked(inner, target, &outcome.text).await;
                    }
                    _ => {
                        tracing::info!(
                            cron = name,
                            output_chars = outcome.text.len(),
                            "cron output has no route, logged only"
                        );
                    }
                }
            } else {
                tracing::warn!(cron = name, finished = ?outcome.finished, "cron invocation did not complete");
            }
            inner
                .meter
                .log(&outcome.metrics.normalized(), invocation_type, None);
            Ok(())
        }
        Err(e) => {
            tracing::error!(cron = name, error = %e, "cron invocation failed");
            Ok(())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_command(
    inner: &Arc<RunnerInner>,
    session_key: &str,
    name: &str,
    args: &str,
) -> String {
    match name {
        "start" => format!(
            "Hi! This is the '{}' workspace. Send a message to get going, or /help for commands.",
            inner.config.name
        ),
        "help" => inner.router.help_text(),
        "queue" => handle_queue(inner, session_key, args),
        "status" => handle_status(inner, session_key),
        "new" => handle_new(inner, session_key).await,
        "compact" => handle_compact(inner, session_key).await,
        _ => format!("Unknown command: /{name}"),
    }
}

fn handle_queue(inner: &Arc<RunnerInner>, session_key: &str, args: &str) -> String {
    if args.is_empty() {
        return format!(
            "Queue mode is {}.",
            inner.queue_modes.mode(session_key).as_str()
        );
    }
    match QueueMode::parse(args) {
        Some(mode) => {
            inner.queue_modes.set_mode(session_key, mode);
            format!("Queue mode set to {}.", mode.as_str())
        }
        None => format!(
            "Unknown queue mode '{args}'. Valid modes: collect, steer, followup, interrupt."
        ),
    }
}

fn handle_status(inner: &Arc<RunnerInner>, session_key: &str) -> String {
    let state = inner.sessions.get_state(session_key);
    let counts = inner.task_store.counts();
    let today = inner.usage.tokens_today(&inner.config.settings.timezone);

    let (conversation, messages) = match state {
        Some(s) => (s.conversation_id, s.message_count),
        None => ("none yet".to_owned(), 0),
    };

    format!(
        "Workspace: {}\n\
         Model: {}\n\
         Conversation: {}\n\
         Messages: {}\n\
         Queue mode: {}\n\
         Tasks: {} pending / {} in progress / {} completed\n\
         Tokens today: {} across {} calls",
        inner.config.name,
        inner.config.settings.model,
        conversation,
        messages,
        inner.queue_modes.mode(session_key).as_str(),
        counts.pending,
        counts.in_progress,
        counts.completed,
        today.total_tokens,
        today.llm_calls,
    )
}

async fn handle_new(inner: &Arc<RunnerInner>, session_key: &str) -> String {
    // Wait out any in-flight invocation; never cancel it.
    let _permit = inner.run_locks.acquire(session_key).await;

    let prior_count = inner
        .sessions
        .get_state(session_key)
        .map_or(0, |s| s.message_count);
    let old_id = inner.sessions.new_conversation(session_key);
    archive(inner, session_key, &old_id, prior_count, None, "manual");

    let thread_id = inner.sessions.get_thread_id(session_key);
    format!("Started a new conversation.\nThread: {thread_id}")
}

async fn handle_compact(inner: &Arc<RunnerInner>, session_key: &str) -> String {
    let _permit = inner.run_locks.acquire(session_key).await;

    let prior_count = inner
        .sessions
        .get_state(session_key)
        .map_or(0, |s| s.message_count);
    let thread_id = inner.sessions.get_thread_id(session_key);

    let request = InvokeRequest {
        system_prompt: inner.prompts.build_system_prompt(inner.catalog.as_ref()),
        thread_id,
        user_message: "Summarize this conversation. Preserve the current goal, \
                       key decisions, open questions, and important facts about \
                       the user or context. Be concise and write in present tense."
            .to_owned(),
        tools: Vec::new(),
        cancel: CancelToken::new(),
        inner_timeout: None,
    };

    let summary = match inner.factory.build().invoke(request).await {
        Ok(outcome) if outcome.is_complete() && !outcome.text.trim().is_empty() => {
            inner.meter.log(
                &outcome.metrics.normalized(),
                InvocationType::User,
                Some(session_key),
            );
            Some(outcome.text)
        }
        Ok(outcome) => {
            tracing::warn!(session_key, finished = ?outcome.finished, "compaction summary unavailable");
            None
        }
        Err(e) => {
            tracing::warn!(session_key, error = %e, "compaction summary failed");
            None
        }
    };

    let old_id = inner.sessions.new_conversation(session_key);
    archive(
        inner,
        session_key,
        &old_id,
        prior_count,
        summary.clone(),
        "compact",
    );

    match summary {
        Some(s) => {
            inner
                .sessions
                .set_seed(session_key, format!("[CONVERSATION COMPACTED]\n{s}"));
            "Conversation compacted. The summary will carry into the new conversation.".to_owned()
        }
        None => "Conversation compacted. Could not generate summary.".to_owned(),
    }
}

fn archive(
    inner: &Arc<RunnerInner>,
    session_key: &str,
    conversation_id: &str,
    message_count: u64,
    summary: Option<String>,
    tag: &str,
) {
    let record = ArchiveRecord {
        session_key: session_key.to_owned(),
        conversation_id: conversation_id.to_owned(),
        archived_at: chrono::Utc::now(),
        message_count,
        summary,
        tag: tag.to_owned(),
    };
    if let Err(e) = inner.archive.append(&record) {
        tracing::warn!(session_key, error = %e, "failed to archive conversation");
    }
}

async fn send_chunked(inner: &Arc<RunnerInner>, session_key: &str, content: &str) {
    for chunk in chunk_text(content, inner.channel.chunk_limit()) {
        if let Err(e) = inner.channel.send_message(session_key, &chunk).await {
            tracing::warn!(session_key, error = %e, "channel send failed");
            break;
        }
    }
}
