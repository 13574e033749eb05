//! Cron trigger subsystem.
//!
//! Definitions are one YAML file per job under `{workspace}/crons/`. The
//! scheduler validates schedules at load time (an invalid schedule
//! deactivates that job, never the workspace), then ticks and enqueues due
//! firings onto the cron lane. `next_run_at` is always computed from "now",
//! so windows missed while the process was down are not made up.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use wr_domain::config::HeartbeatConfig;
use wr_domain::{Error, Result};

use crate::cron::{parse_tz, CronExpr};
use crate::lanes::{Lane, LaneItem, LanePayload, LaneQueue};

/// Reserved job name for the workspace heartbeat.
pub const HEARTBEAT_JOB: &str = "heartbeat";

const TICK: Duration = Duration::from_secs(15);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a cron's output goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronOutput {
    /// Channel name (telegram, discord, ...).
    pub channel: String,
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub guild_id: Option<i64>,
    #[serde(default)]
    pub channel_id: Option<i64>,
}

impl CronOutput {
    /// Routing target as a session key, when an id is configured.
    pub fn session_key(&self) -> Option<String> {
        self.chat_id
            .or(self.channel_id)
            .or(self.guild_id)
            .map(|id| format!("{}:{id}", self.channel))
    }
}

/// One cron job, loaded from `crons/<name>.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronDefinition {
    pub name: String,
    /// Five-field cron expression.
    pub schedule: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// User prompt injected when the job fires.
    pub prompt: String,
    pub output: CronOutput,
}

fn d_true() -> bool {
    true
}

/// Load all definitions from `{workspace}/crons/*.yaml`. Unreadable or
/// unparsable files are skipped with a warning.
pub fn load_definitions(workspace_path: &Path) -> Vec<CronDefinition> {
    let crons_dir = workspace_path.join("crons");
    if !crons_dir.is_dir() {
        return Vec::new();
    }

    let entries = match std::fs::read_dir(&crons_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %crons_dir.display(), error = %e, "cannot read crons dir");
            return Vec::new();
        }
    };

    let mut defs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable cron file");
                continue;
            }
        };
        match serde_yaml::from_str::<CronDefinition>(&raw) {
            Ok(def) => defs.push(def),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid cron file");
            }
        }
    }

    defs.sort_by(|a, b| a.name.cmp(&b.name));
    defs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CronJob {
    name: String,
    prompt: String,
    route: Option<String>,
    heartbeat: bool,
    expr: CronExpr,
    next_run_at: DateTime<Utc>,
}

/// Evaluates schedules and injects firings into the cron lane.
pub struct CronScheduler {
    workspace: String,
    tz: chrono_tz::Tz,
    lanes: Arc<LaneQueue>,
    jobs: Arc<Mutex<Vec<CronJob>>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(workspace: impl Into<String>, timezone: &str, lanes: Arc<LaneQueue>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workspace: workspace.into(),
            tz: parse_tz(timezone),
            lanes,
            jobs: Arc::new(Mutex::new(Vec::new())),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Rebuild the active job set from definitions (plus the optional
    /// heartbeat). Invalid schedules deactivate the single job.
    pub fn rebuild(&self, defs: &[CronDefinition], heartbeat: Option<&HeartbeatConfig>) {
        let now = Utc::now();
        let mut jobs = Vec::new();

        for def in defs {
            if !def.enabled {
                tracing::debug!(cron = %def.name, "cron disabled, skipping");
                continue;
            }
            let expr = match CronExpr::parse(&def.schedule) {
                Ok(expr) => expr,
                Err(e) => {
                    tracing::warn!(cron = %def.name, error = %e, "invalid schedule, job inactive");
                    continue;
                }
            };
            let route = def.output.session_key();
            if route.is_none() {
                tracing::warn!(cron = %def.name, "no output target id, output will be logged only");
            }
            let Some(next_run_at) = expr.next_after(&now, self.tz) else {
                tracing::warn!(cron = %def.name, "schedule never fires, job inactive");
                continue;
            };
            jobs.push(CronJob {
                name: def.name.clone(),
                prompt: def.prompt.clone(),
                route,
                heartbeat: false,
                expr,
                next_run_at,
            });
        }

        if let Some(hb) = heartbeat {
            match CronExpr::parse(&hb.schedule) {
                Ok(expr) => {
                    if let Some(next_run_at) = expr.next_after(&now, self.tz) {
                        jobs.push(CronJob {
                            name: HEARTBEAT_JOB.into(),
                            // The prompt is read from HEARTBEAT.md at dispatch.
                            prompt: String::new(),
                            route: None,
                            heartbeat: true,
                            expr,
                            next_run_at,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invalid heartbeat schedule, heartbeat inactive");
                }
            }
        }

        tracing::info!(
            workspace = %self.workspace,
            jobs = jobs.len(),
            "cron schedules rebuilt"
        );
        *self.jobs.lock() = jobs;
    }

    /// Start the tick loop.
    pub fn start(&self) {
        let workspace = self.workspace.clone();
        let tz = self.tz;
        let lanes = self.lanes.clone();
        let jobs = self.jobs.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick_jobs(&workspace, tz, &lanes, &jobs, Utc::now()),
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop the tick loop; no new firings are injected afterwards.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fire one job immediately. Same semantics as a scheduled tick.
    pub fn trigger(&self, name: &str) -> Result<()> {
        let jobs = self.jobs.lock();
        let job = jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| Error::NotFound(format!("cron '{name}' not found")))?;
        fire_job(&self.workspace, &self.lanes, job);
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    #[cfg(test)]
    fn tick_at(&self, now: DateTime<Utc>) {
        tick_jobs(&self.workspace, self.tz, &self.lanes, &self.jobs, now);
    }
}

fn tick_jobs(
    workspace: &str,
    tz: chrono_tz::Tz,
    lanes: &Arc<LaneQueue>,
    jobs: &Arc<Mutex<Vec<CronJob>>>,
    now: DateTime<Utc>,
) {
    let mut jobs = jobs.lock();
    for job in jobs.iter_mut() {
        if job.next_run_at > now {
            continue;
        }
        fire_job(workspace, lanes, job);
        // Advance from now, not from the missed instant: downtime windows
        // are dropped, not replayed.
        match job.expr.next_after(&now, tz) {
            Some(next) => job.next_run_at = next,
            None => {
                tracing::warn!(cron = %job.name, "no further occurrences");
                job.next_run_at = DateTime::<Utc>::MAX_UTC;
            }
        }
    }
}

fn fire_job(workspace: &str, lanes: &Arc<LaneQueue>, job: &CronJob) {
    let item = LaneItem {
        lane: Lane::Cron,
        session_key: format!("cron:{workspace}:{}", job.name),
        payload: LanePayload::Cron {
            name: job.name.clone(),
            prompt: job.prompt.clone(),
            route: job.route.clone(),
            heartbeat: job.heartbeat,
        },
        enqueue_ts: Utc::now(),
        bypass_debounce: true,
    };
    wr_domain::TraceEvent::CronFired {
        workspace: workspace.to_owned(),
        cron: job.name.clone(),
        heartbeat: job.heartbeat,
    }
    .emit();
    if let Err(e) = lanes.enqueue(item) {
        tracing::warn!(cron = %job.name, error = %e, "failed to enqueue cron firing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use wr_domain::config::LanesConfig;

    fn lanes() -> Arc<LaneQueue> {
        Arc::new(LaneQueue::new(&LanesConfig::default()))
    }

    fn def(name: &str, schedule: &str) -> CronDefinition {
        CronDefinition {
            name: name.into(),
            schedule: schedule.into(),
            enabled: true,
            prompt: format!("prompt for {name}"),
            output: CronOutput {
                channel: "telegram".into(),
                chat_id: Some(42),
                guild_id: None,
                channel_id: None,
            },
        }
    }

    #[test]
    fn output_session_key_prefers_chat_id() {
        let out = CronOutput {
            channel: "telegram".into(),
            chat_id: Some(42),
            guild_id: Some(1),
            channel_id: Some(2),
        };
        assert_eq!(out.session_key().unwrap(), "telegram:42");

        let none = CronOutput {
            channel: "discord".into(),
            chat_id: None,
            guild_id: None,
            channel_id: None,
        };
        assert!(none.session_key().is_none());
    }

    #[tokio::test]
    async fn rebuild_skips_invalid_and_disabled() {
        let sched = CronScheduler::new("ws", "UTC", lanes());
        let mut disabled = def("off", "* * * * *");
        disabled.enabled = false;

        sched.rebuild(
            &[def("ok", "*/5 * * * *"), def("bad", "not a cron"), disabled],
            None,
        );
        assert_eq!(sched.job_count(), 1);
    }

    #[tokio::test]
    async fn rebuild_includes_heartbeat() {
        let sched = CronScheduler::new("ws", "UTC", lanes());
        sched.rebuild(
            &[],
            Some(&HeartbeatConfig {
                schedule: "0 * * * *".into(),
            }),
        );
        assert_eq!(sched.job_count(), 1);
    }

    #[tokio::test]
    async fn trigger_enqueues_onto_cron_lane() {
        let q = lanes();
        let sched = CronScheduler::new("ws", "UTC", q.clone());
        sched.rebuild(&[def("digest", "0 9 * * *")], None);

        sched.trigger("digest").unwrap();
        assert_eq!(q.depth(Lane::Cron), 1);

        let item = q.take(Lane::Cron).await;
        assert_eq!(item.session_key, "cron:ws:digest");
        match item.payload {
            LanePayload::Cron { name, route, heartbeat, .. } => {
                assert_eq!(name, "digest");
                assert_eq!(route.as_deref(), Some("telegram:42"));
                assert!(!heartbeat);
            }
            _ => panic!("expected cron payload"),
        }
        q.release(Lane::Cron);
    }

    #[tokio::test]
    async fn trigger_unknown_job_is_not_found() {
        let sched = CronScheduler::new("ws", "UTC", lanes());
        sched.rebuild(&[], None);
        assert!(matches!(
            sched.trigger("ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ticks_fire_each_due_minute_exactly_once() {
        let q = lanes();
        let sched = CronScheduler::new("ws", "UTC", q.clone());
        sched.rebuild(&[def("minutely", "* * * * *")], None);

        // Anchor at the start of the current minute so the rebuilt
        // next_run_at is exactly one minute in.
        let start = Utc::now()
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap();
        // Several ticks inside the same minute fire at most once; two minutes
        // of ticks fire exactly twice.
        for secs in [15, 30, 45, 61, 75, 90, 121] {
            sched.tick_at(start + chrono::Duration::seconds(secs));
        }
        assert_eq!(q.depth(Lane::Cron), 2);
    }

    #[tokio::test]
    async fn downtime_windows_are_not_replayed() {
        let q = lanes();
        let sched = CronScheduler::new("ws", "UTC", q.clone());
        sched.rebuild(&[def("minutely", "* * * * *")], None);

        // A single tick an hour later fires once, not sixty times.
        sched.tick_at(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(q.depth(Lane::Cron), 1);
    }

    #[test]
    fn load_definitions_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let crons = dir.path().join("crons");
        std::fs::create_dir_all(&crons).unwrap();

        std::fs::write(
            crons.join("daily.yaml"),
            "name: daily\nschedule: '0 9 * * *'\nprompt: Morning digest\noutput:\n  channel: telegram\n  chat_id: 42\n",
        )
        .unwrap();
        std::fs::write(crons.join("broken.yaml"), "{{{{").unwrap();
        std::fs::write(crons.join("notes.txt"), "ignored").unwrap();

        let defs = load_definitions(dir.path());
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "daily");
        assert!(defs[0].enabled);
        assert_eq!(defs[0].output.session_key().unwrap(), "telegram:42");
    }

    #[test]
    fn load_definitions_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_definitions(dir.path()).is_empty());
    }
}
