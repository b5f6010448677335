use anyhow::Result;
use clap::Parser;
use console::style;

use muster_core::config::MusterConfig;

/// Validate a configuration file.
#[derive(Parser)]
pub struct CheckConfigCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "muster.toml")]
    pub config: String,
}

impl CheckConfigCommand {
    /// Execute the check-config command.
    pub async fn execute(self) -> Result<()> {
        let config = MusterConfig::from_file(&self.config)?;
        config.validate()?;

        println!("  {} {} is valid", style("✓").green(), self.config);
        println!(
            "    service   {}/{}/{} v{}",
            config.service.environment,
            config.service.app_id,
            config.service.name,
            config.service.version
        );
        println!(
            "    registry  {}/{} ({:?})",
            config.registry.domain, config.registry.project, config.registry.backend
        );
        println!(
            "    heartbeat every {}s, lease {}s",
            config.instance.health_check.interval_secs,
            config.instance.health_check.lease().as_secs()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_valid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[registry]\nbackend = \"memory\"").unwrap();

        let cmd = CheckConfigCommand {
            config: file.path().to_string_lossy().into_owned(),
        };
        assert!(cmd.execute().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[instance.health_check]\ninterval_secs = 0").unwrap();

        let cmd = CheckConfigCommand {
            config: file.path().to_string_lossy().into_owned(),
        };
        assert!(cmd.execute().await.is_err());
    }
}
