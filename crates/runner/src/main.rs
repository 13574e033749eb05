use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wr_channels::Channel;
use wr_domain::config::{Config, ConfigSeverity, WorkspaceConfig};
use wr_domain::invoker::InvokerFactory;
use wr_domain::tool::{StaticToolCatalog, ToolCatalog};
use wr_domain::Result;

use wr_runner::cli::{load_config, Cli, Command, ConfigCommand};
use wr_runner::console::{echo_factory, ConsoleChannel};
use wr_runner::orchestrator::{Orchestrator, WorkspaceEnvironment};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run(Arc::new(config)).await
        }
        Some(Command::Discover) => {
            let config = load_config(&cli.config)?;
            for name in Orchestrator::discover_workspaces(&config.workspaces_root) {
                println!("{name}");
            }
            Ok(())
        }
        Some(Command::Config {
            command: ConfigCommand::Validate,
        }) => {
            let config = load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => println!("warning: {issue}"),
                    ConfigSeverity::Error => println!("error: {issue}"),
                }
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("config OK");
            Ok(())
        }
        Some(Command::Version) => {
            println!("warren {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,wr_runner=debug")),
        )
        .json()
        .init();
}

/// Built-in environment: console transport + echo invoker. Deployments with
/// real channel adapters and providers supply their own
/// [`WorkspaceEnvironment`].
struct ConsoleEnvironment;

impl WorkspaceEnvironment for ConsoleEnvironment {
    fn channel(&self, _config: &WorkspaceConfig) -> Result<Arc<dyn Channel>> {
        Ok(Arc::new(ConsoleChannel::new()))
    }

    fn invoker_factory(&self, config: &WorkspaceConfig) -> Arc<dyn InvokerFactory> {
        echo_factory(&config.settings.model)
    }

    fn tool_catalog(&self, _config: &WorkspaceConfig) -> Arc<dyn ToolCatalog> {
        Arc::new(StaticToolCatalog::new())
    }
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("warren starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let orchestrator = Arc::new(Orchestrator::new(config, Arc::new(ConsoleEnvironment)));
    let failures = orchestrator.start_all().await;
    for (name, error) in &failures {
        tracing::error!(workspace = %name, error = %error, "workspace failed to start");
    }
    if orchestrator.running_count() == 0 {
        anyhow::bail!("no workspaces running");
    }

    tracing::info!(
        running = orchestrator.running_count(),
        "warren ready — press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    orchestrator.stop_all().await;
    Ok(())
}
