use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;

use muster::Muster;
use muster_core::config::{MusterConfig, RegistryBackend};

use super::{init_tracing, load_config};

/// Register this node and keep it alive until interrupted.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "muster.toml")]
    pub config: String,

    /// Use process-local backends instead of PostgreSQL.
    #[arg(long)]
    pub in_memory: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log as JSON lines.
    #[arg(long)]
    pub json: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        init_tracing(self.verbose, self.json);

        let config = self.resolve_config()?;

        if !self.json {
            println!();
            println!(
                "  {} v{}  {}",
                style("MUSTER").bold().cyan(),
                env!("CARGO_PKG_VERSION"),
                style(format!(
                    "{}/{}/{}",
                    config.service.environment, config.service.app_id, config.service.name
                ))
                .dim()
            );
            println!();
        }

        let muster = Muster::builder().config(config).build()?;
        info!(host = %muster.host_name(), "Node starting");

        muster.run().await?;

        if !self.json {
            println!("\n  {} Stopped", style("✓").green());
        }
        Ok(())
    }

    /// Load the file, apply command-line overrides, then validate.
    fn resolve_config(&self) -> Result<MusterConfig> {
        let mut config = load_config(&self.config, self.in_memory)?;
        if self.in_memory {
            config.registry.backend = RegistryBackend::Memory;
        }
        config.validate()?;
        Ok(config)
    }
}
