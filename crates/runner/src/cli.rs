//! Command-line interface and config loading for the `warren` binary.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use wr_domain::config::Config;

#[derive(Parser)]
#[command(name = "warren", about = "Multi-workspace agent orchestration runtime")]
pub struct Cli {
    /// Path to the runtime config file.
    #[arg(short, long, default_value = "warren.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the orchestrator over all discovered workspaces (default).
    Serve,
    /// List valid workspaces under the configured root.
    Discover,
    /// Config inspection and validation.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
}

/// Load the runtime config. A missing file yields the defaults.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}
