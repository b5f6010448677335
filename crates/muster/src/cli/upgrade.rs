use anyhow::Result;
use clap::Parser;
use console::style;

use muster::Muster;

use super::{init_tracing, load_config};

/// Run the cluster version upgrade and exit.
#[derive(Parser)]
pub struct UpgradeCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "muster.toml")]
    pub config: String,

    /// Write the version record even if it is not older than this binary.
    #[arg(long)]
    pub force: bool,
}

impl UpgradeCommand {
    /// Execute the upgrade command.
    pub async fn execute(self) -> Result<()> {
        init_tracing(false, false);

        let config = load_config(&self.config, false)?;
        config.validate()?;

        let muster = Muster::builder().config(config).build()?;
        let version = muster.version().to_string();
        muster.upgrade(self.force).await?;

        println!(
            "  {} Upgrade check done for version {}",
            style("✓").green(),
            style(version).bold()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_requires_config_file() {
        let cmd = UpgradeCommand {
            config: "/nonexistent/muster.toml".to_string(),
            force: false,
        };
        assert!(cmd.execute().await.is_err());
    }
}
