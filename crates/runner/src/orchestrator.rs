//! Lifecycle of N workspace runners.
//!
//! Runners start and stop concurrently with per-instance failure isolation:
//! one workspace failing to start never takes down its siblings, and
//! `stop_all` never raises. There is no shared mutable state between
//! runners and no cross-workspace ordering.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;

use wr_channels::Channel;
use wr_domain::config::{Config, WorkspaceConfig};
use wr_domain::invoker::InvokerFactory;
use wr_domain::tool::ToolCatalog;
use wr_domain::{Error, Result};

use crate::workspace::WorkspaceRunner;

/// Supplies the per-workspace external collaborators: the channel binding,
/// the invoker factory, and the tool catalog.
pub trait WorkspaceEnvironment: Send + Sync {
    fn channel(&self, config: &WorkspaceConfig) -> Result<Arc<dyn Channel>>;
    fn invoker_factory(&self, config: &WorkspaceConfig) -> Arc<dyn InvokerFactory>;
    fn tool_catalog(&self, config: &WorkspaceConfig) -> Arc<dyn ToolCatalog>;
}

/// Manages all workspace runners in the process.
pub struct Orchestrator {
    config: Arc<Config>,
    env: Arc<dyn WorkspaceEnvironment>,
    runners: Mutex<HashMap<String, WorkspaceRunner>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, env: Arc<dyn WorkspaceEnvironment>) -> Self {
        Self {
            config,
            env,
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Scan for valid workspaces: directories containing `AGENT.md`.
    pub fn discover_workspaces(root: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(root) else {
            tracing::warn!(path = %root.display(), "workspaces root does not exist");
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir() && e.path().join("AGENT.md").is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        tracing::info!(count = names.len(), "discovered workspaces");
        names
    }

    /// Start every enabled discovered workspace concurrently. Failures are
    /// collected and returned per workspace; successful runners stay up.
    pub async fn start_all(&self) -> Vec<(String, Error)> {
        let names = Self::discover_workspaces(&self.config.workspaces_root);
        let mut failures = Vec::new();
        let mut pending = Vec::new();

        for name in names {
            let ws = self.config.workspace_config(&name);
            if !ws.enabled {
                tracing::info!(workspace = %name, "workspace disabled, skipping");
                continue;
            }
            if self.runners.lock().contains_key(&name) {
                tracing::warn!(workspace = %name, "workspace already running, skipping");
                continue;
            }
            match self.build_runner(ws) {
                Ok(runner) => pending.push((name, runner)),
                Err(e) => failures.push((name, e)),
            }
        }

        let started = join_all(pending.into_iter().map(|(name, runner)| async move {
            let result = runner.start().await;
            (name, runner, result)
        }))
        .await;

        let mut runners = self.runners.lock();
        for (name, runner, result) in started {
            match result {
                Ok(()) => {
                    runners.insert(name, runner);
                }
                Err(e) => {
                    tracing::error!(workspace = %name, error = %e, "failed to start workspace");
                    failures.push((name, e));
                }
            }
        }
        tracing::info!(running = runners.len(), failed = failures.len(), "start_all complete");
        failures
    }

    /// Stop every runner concurrently. Never raises.
    pub async fn stop_all(&self) {
        let runners: Vec<(String, WorkspaceRunner)> =
            self.runners.lock().drain().collect();
        if runners.is_empty() {
            return;
        }

        tracing::info!(count = runners.len(), "stopping all workspace runners");
        join_all(runners.into_iter().map(|(name, runner)| async move {
            runner.stop().await;
            tracing::info!(workspace = %name, "workspace stopped");
        }))
        .await;
    }

    /// Start a single workspace. Fails if it is already running.
    pub async fn start_workspace(&self, name: &str) -> Result<()> {
        if self.runners.lock().contains_key(name) {
            return Err(Error::Validation(format!(
                "workspace '{name}' is already running"
            )));
        }

        let ws = self.config.workspace_config(name);
        let runner = self.build_runner(ws)?;
        runner.start().await?;
        self.runners.lock().insert(name.to_owned(), runner);
        tracing::info!(workspace = %name, "workspace started");
        Ok(())
    }

    /// Stop a single workspace. Stopping an unknown workspace only warns.
    pub async fn stop_workspace(&self, name: &str) {
        let runner = self.runners.lock().remove(name);
        match runner {
            Some(runner) => {
                runner.stop().await;
                tracing::info!(workspace = %name, "workspace stopped");
            }
            None => {
                tracing::warn!(workspace = %name, "workspace is not running");
            }
        }
    }

    /// Stop and start a workspace with a fresh runner instance.
    pub async fn restart_workspace(&self, name: &str) -> Result<()> {
        self.stop_workspace(name).await;
        self.start_workspace(name).await
    }

    /// Config changes require a full restart.
    pub async fn reload_workspace_config(&self, name: &str) -> Result<()> {
        tracing::info!(workspace = %name, "config reload triggers restart");
        self.restart_workspace(name).await
    }

    /// Prompt files are read on every dispatch; nothing to do.
    pub fn reload_workspace_prompt(&self, name: &str) {
        if self.runners.lock().contains_key(name) {
            tracing::info!(
                workspace = %name,
                "prompt files reload on the next invocation"
            );
        } else {
            tracing::warn!(workspace = %name, "workspace is not running");
        }
    }

    /// Manually fire a cron job in a running workspace.
    pub fn trigger_cron(&self, workspace: &str, cron_name: &str) -> Result<()> {
        let runner = self
            .runners
            .lock()
            .get(workspace)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workspace '{workspace}' is not running")))?;
        runner.trigger_cron(cron_name)
    }

    pub fn running_count(&self) -> usize {
        self.runners.lock().len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.runners.lock().contains_key(name)
    }

    fn build_runner(&self, config: WorkspaceConfig) -> Result<WorkspaceRunner> {
        let channel = self.env.channel(&config)?;
        let factory = self.env.invoker_factory(&config);
        let catalog = self.env.tool_catalog(&config);
        Ok(WorkspaceRunner::new(config, channel, factory, catalog))
    }
}
