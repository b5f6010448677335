mod check_config;
mod run;
mod upgrade;

pub use check_config::CheckConfigCommand;
pub use run::RunCommand;
pub use upgrade::UpgradeCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use muster_core::config::MusterConfig;

/// MUSTER - cluster self-registration and version upgrades
#[derive(Parser)]
#[command(name = "muster")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Register this node and keep it alive until interrupted.
    Run(RunCommand),

    /// Run the cluster version upgrade and exit.
    Upgrade(UpgradeCommand),

    /// Validate a configuration file.
    CheckConfig(CheckConfigCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run(cmd) => cmd.execute().await,
            Commands::Upgrade(cmd) => cmd.execute().await,
            Commands::CheckConfig(cmd) => cmd.execute().await,
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the level.
fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Load the config file, or defaults when `allow_missing` and it does not exist.
fn load_config(path: &str, allow_missing: bool) -> Result<MusterConfig> {
    if !Path::new(path).exists() {
        if allow_missing {
            return Ok(MusterConfig::default());
        }
        anyhow::bail!("Configuration file not found: {}", path);
    }
    tracing::info!("Loading configuration from {}", path);
    Ok(MusterConfig::from_file(path)?)
}
