//! Runtime configuration model.
//!
//! The global config (`warren.toml`) names the workspaces root and the
//! default workspace settings; per-workspace tables override individual
//! fields. Cron definitions are *not* part of this file — they live as
//! per-job YAML under each workspace's `crons/` directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happens when a message arrives for a session with pending or
/// in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Buffer and dispatch as one combined message after debounce/completion.
    Collect,
    /// Cancel the in-flight invocation and dispatch the new content.
    Steer,
    /// Hold new content; dispatch right after the current invocation ends.
    Followup,
    /// Enqueue immediately as an independent item, no debounce.
    Interrupt,
}

impl Default for QueueMode {
    fn default() -> Self {
        Self::Collect
    }
}

impl QueueMode {
    /// Parse a user-supplied mode name. Case-insensitive; `default` and
    /// `reset` are aliases for `collect`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collect" | "default" | "reset" => Some(Self::Collect),
            "steer" => Some(Self::Steer),
            "followup" => Some(Self::Followup),
            "interrupt" => Some(Self::Interrupt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Steer => "steer",
            Self::Followup => "followup",
            Self::Interrupt => "interrupt",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lanes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Behaviour when a lane is at its queue cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued item to make room.
    Oldest,
    /// Drop the incoming item.
    Newest,
    /// Fail the enqueue with a capacity error.
    Reject,
}

impl Default for DropPolicy {
    fn default() -> Self {
        Self::Oldest
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanesConfig {
    /// Concurrent main-lane dispatches (interactive sessions).
    #[serde(default = "d_1")]
    pub main_concurrency: usize,
    /// Concurrent sub-agent executions.
    #[serde(default = "d_8")]
    pub subagent_concurrency: usize,
    /// Concurrent cron dispatches.
    #[serde(default = "d_1")]
    pub cron_concurrency: usize,
    /// Per-lane queue depth cap.
    #[serde(default = "d_20")]
    pub cap: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            main_concurrency: 1,
            subagent_concurrency: 8,
            cron_concurrency: 1,
            cap: 20,
            drop_policy: DropPolicy::Oldest,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const MIN_SUBAGENT_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_SUBAGENT_TIMEOUT_MINUTES: u32 = 120;

/// Clamp a requested sub-agent timeout into the permitted window.
pub fn clamp_timeout_minutes(minutes: u32) -> u32 {
    minutes.clamp(MIN_SUBAGENT_TIMEOUT_MINUTES, MAX_SUBAGENT_TIMEOUT_MINUTES)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubAgentsConfig {
    /// Maximum simultaneous sub-agents; admission fails fast above this.
    #[serde(default = "d_8")]
    pub max_concurrent: usize,
    #[serde(default = "d_30")]
    pub default_timeout_minutes: u32,
    /// Terminal records older than this are pruned by the cleanup pass.
    #[serde(default = "d_24")]
    pub max_age_hours: u32,
}

impl Default for SubAgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_timeout_minutes: 30,
            max_age_hours: 24,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Optional periodic self-invocation using the workspace HEARTBEAT.md prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// Five-field cron expression, evaluated in the workspace timezone.
    pub schedule: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSettings {
    #[serde(default = "d_provider")]
    pub provider: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_temperature")]
    pub temperature: f64,
    #[serde(default = "d_30")]
    pub max_turns: u32,
    #[serde(default)]
    pub queue_mode: QueueMode,
    /// Per-session debounce window in milliseconds.
    #[serde(default = "d_500")]
    pub debounce_ms: u64,
    /// IANA timezone for cron evaluation and daily usage aggregation.
    #[serde(default = "d_utc")]
    pub timezone: String,
    #[serde(default)]
    pub lanes: LanesConfig,
    #[serde(default)]
    pub subagents: SubAgentsConfig,
    /// Main-lane drain grace during stop, in seconds.
    #[serde(default = "d_30_u64")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            provider: d_provider(),
            model: d_model(),
            temperature: 0.7,
            max_turns: 30,
            queue_mode: QueueMode::Collect,
            debounce_ms: 500,
            timezone: d_utc(),
            lanes: LanesConfig::default(),
            subagents: SubAgentsConfig::default(),
            stop_grace_secs: 30,
            heartbeat: None,
        }
    }
}

/// Per-workspace partial override of the default settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub queue_mode: Option<QueueMode>,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub lanes: Option<LanesConfig>,
    #[serde(default)]
    pub subagents: Option<SubAgentsConfig>,
    #[serde(default)]
    pub stop_grace_secs: Option<u64>,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

/// Fully resolved configuration for one workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceConfig {
    pub name: String,
    pub path: PathBuf,
    pub enabled: bool,
    pub settings: WorkspaceSettings,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "d_workspaces_root")]
    pub workspaces_root: PathBuf,
    #[serde(default)]
    pub defaults: WorkspaceSettings,
    /// Per-workspace override tables, keyed by workspace name.
    #[serde(default)]
    pub workspaces: BTreeMap<String, WorkspaceOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspaces_root: d_workspaces_root(),
            defaults: WorkspaceSettings::default(),
            workspaces: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Resolve the effective configuration for one workspace, applying any
    /// override table on top of the defaults.
    pub fn workspace_config(&self, name: &str) -> WorkspaceConfig {
        let mut settings = self.defaults.clone();
        let mut enabled = true;

        if let Some(ov) = self.workspaces.get(name) {
            if let Some(e) = ov.enabled {
                enabled = e;
            }
            if let Some(v) = &ov.provider {
                settings.provider = v.clone();
            }
            if let Some(v) = &ov.model {
                settings.model = v.clone();
            }
            if let Some(v) = ov.temperature {
                settings.temperature = v;
            }
            if let Some(v) = ov.max_turns {
                settings.max_turns = v;
            }
            if let Some(v) = ov.queue_mode {
                settings.queue_mode = v;
            }
            if let Some(v) = ov.debounce_ms {
                settings.debounce_ms = v;
            }
            if let Some(v) = &ov.timezone {
                settings.timezone = v.clone();
            }
            if let Some(v) = &ov.lanes {
                settings.lanes = v.clone();
            }
            if let Some(v) = &ov.subagents {
                settings.subagents = v.clone();
            }
            if let Some(v) = ov.stop_grace_secs {
                settings.stop_grace_secs = v;
            }
            if let Some(v) = &ov.heartbeat {
                settings.heartbeat = Some(v.clone());
            }
        }

        WorkspaceConfig {
            name: name.to_owned(),
            path: self.workspaces_root.join(name),
            enabled,
            settings,
        }
    }

    /// Validate the whole config, returning issues rather than failing on
    /// the first problem.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        for (name, _) in &self.workspaces {
            if !valid_workspace_name(name) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!(
                        "invalid workspace name '{name}' (allowed: letters, digits, '_', '-')"
                    ),
                });
            }
        }

        let check_settings = |issues: &mut Vec<ConfigIssue>, scope: &str, s: &WorkspaceSettings| {
            if s.lanes.main_concurrency == 0
                || s.lanes.subagent_concurrency == 0
                || s.lanes.cron_concurrency == 0
            {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("{scope}: lane concurrency must be at least 1"),
                });
            }
            if s.lanes.cap == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("{scope}: lane cap must be at least 1"),
                });
            }
            if s.subagents.max_concurrent == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("{scope}: subagents.max_concurrent must be at least 1"),
                });
            }
            if s.subagents.default_timeout_minutes
                != clamp_timeout_minutes(s.subagents.default_timeout_minutes)
            {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!(
                        "{scope}: subagents.default_timeout_minutes outside {}..={}, will be clamped",
                        MIN_SUBAGENT_TIMEOUT_MINUTES, MAX_SUBAGENT_TIMEOUT_MINUTES
                    ),
                });
            }
            if s.timezone.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!("{scope}: empty timezone, falling back to UTC"),
                });
            }
            if s.debounce_ms > 60_000 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!("{scope}: debounce_ms over 60s is probably a mistake"),
                });
            }
        };

        check_settings(&mut issues, "defaults", &self.defaults);
        for name in self.workspaces.keys() {
            let resolved = self.workspace_config(name);
            check_settings(&mut issues, &format!("workspaces.{name}"), &resolved.settings);
        }

        issues
    }
}

/// Workspace names: `^[A-Za-z0-9_-]+$`.
pub fn valid_workspace_name(name: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new("^[A-Za-z0-9_-]+$").expect("static regex"));
    re.is_match(name)
}

fn d_1() -> usize {
    1
}
fn d_8() -> usize {
    8
}
fn d_20() -> usize {
    20
}
fn d_24() -> u32 {
    24
}
fn d_30() -> u32 {
    30
}
fn d_30_u64() -> u64 {
    30
}
fn d_500() -> u64 {
    500
}
fn d_temperature() -> f64 {
    0.7
}
fn d_provider() -> String {
    "anthropic".into()
}
fn d_model() -> String {
    "claude-sonnet-4".into()
}
fn d_utc() -> String {
    "UTC".into()
}
fn d_workspaces_root() -> PathBuf {
    PathBuf::from("./workspaces")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_parse_aliases() {
        assert_eq!(QueueMode::parse("collect"), Some(QueueMode::Collect));
        assert_eq!(QueueMode::parse("DEFAULT"), Some(QueueMode::Collect));
        assert_eq!(QueueMode::parse("reset"), Some(QueueMode::Collect));
        assert_eq!(QueueMode::parse("Steer"), Some(QueueMode::Steer));
        assert_eq!(QueueMode::parse("followup"), Some(QueueMode::Followup));
        assert_eq!(QueueMode::parse("interrupt"), Some(QueueMode::Interrupt));
        assert_eq!(QueueMode::parse("bogus"), None);
    }

    #[test]
    fn workspace_name_validation() {
        assert!(valid_workspace_name("gilfoyle"));
        assert!(valid_workspace_name("ws-2_test"));
        assert!(!valid_workspace_name(""));
        assert!(!valid_workspace_name("has space"));
        assert!(!valid_workspace_name("dot.name"));
        assert!(!valid_workspace_name("../escape"));
    }

    #[test]
    fn defaults_match_resource_caps() {
        let s = WorkspaceSettings::default();
        assert_eq!(s.lanes.main_concurrency, 1);
        assert_eq!(s.lanes.subagent_concurrency, 8);
        assert_eq!(s.lanes.cron_concurrency, 1);
        assert_eq!(s.lanes.cap, 20);
        assert_eq!(s.lanes.drop_policy, DropPolicy::Oldest);
        assert_eq!(s.subagents.max_concurrent, 8);
        assert_eq!(s.subagents.default_timeout_minutes, 30);
        assert_eq!(s.subagents.max_age_hours, 24);
        assert_eq!(s.stop_grace_secs, 30);
    }

    #[test]
    fn clamp_timeout_window() {
        assert_eq!(clamp_timeout_minutes(0), 1);
        assert_eq!(clamp_timeout_minutes(1), 1);
        assert_eq!(clamp_timeout_minutes(30), 30);
        assert_eq!(clamp_timeout_minutes(120), 120);
        assert_eq!(clamp_timeout_minutes(500), 120);
    }

    #[test]
    fn override_merges_over_defaults() {
        let toml_src = r#"
            workspaces_root = "./ws"

            [defaults]
            model = "claude-sonnet-4"
            debounce_ms = 500

            [workspaces.gilfoyle]
            model = "claude-opus-4"
            queue_mode = "steer"

            [workspaces.dinesh]
            enabled = false
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();

        let g = config.workspace_config("gilfoyle");
        assert!(g.enabled);
        assert_eq!(g.settings.model, "claude-opus-4");
        assert_eq!(g.settings.queue_mode, QueueMode::Steer);
        assert_eq!(g.settings.debounce_ms, 500);
        assert_eq!(g.path, PathBuf::from("./ws/gilfoyle"));

        let d = config.workspace_config("dinesh");
        assert!(!d.enabled);
        assert_eq!(d.settings.model, "claude-sonnet-4");
    }

    #[test]
    fn unknown_workspace_resolves_to_defaults() {
        let config = Config::default();
        let ws = config.workspace_config("fresh");
        assert!(ws.enabled);
        assert_eq!(ws.settings, WorkspaceSettings::default());
    }

    #[test]
    fn validate_flags_bad_names_and_zero_caps() {
        let mut config = Config::default();
        config
            .workspaces
            .insert("bad name".into(), WorkspaceOverride::default());
        config.workspaces.insert(
            "ok".into(),
            WorkspaceOverride {
                lanes: Some(LanesConfig {
                    main_concurrency: 0,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("bad name")));
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("concurrency")));
    }

    #[test]
    fn validate_clean_config_is_quiet() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty());
    }
}
