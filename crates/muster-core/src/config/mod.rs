mod cluster;
mod database;

pub use cluster::{LockConfig, UpgradeConfig, GLOBAL_LOCK_NAME, SERVER_INFO_KEY};
pub use database::DatabaseConfig;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MusterError, Result};

/// Longest accepted heartbeat interval (one day).
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

/// Root configuration for MUSTER.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MusterConfig {
    /// The service this node registers itself as.
    #[serde(default)]
    pub service: ServiceConfig,

    /// The instance record of this process.
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Registry scope and backend.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Global lock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Version upgrade configuration.
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

impl MusterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MusterError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// Does not validate: callers apply their overrides first, then call
    /// [`MusterConfig::validate`].
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content);

        toml::from_str(&content)
            .map_err(|e| MusterError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check the invariants the registration loop depends on.
    pub fn validate(&self) -> Result<()> {
        if self.service.app_id.trim().is_empty() {
            return Err(MusterError::Config("service.app_id must not be empty".into()));
        }
        if self.service.name.trim().is_empty() {
            return Err(MusterError::Config("service.name must not be empty".into()));
        }
        if self.service.version.trim().is_empty() {
            return Err(MusterError::Config("service.version must not be empty".into()));
        }
        let interval = self.instance.health_check.interval_secs;
        if interval == 0 || interval > MAX_HEARTBEAT_INTERVAL_SECS {
            return Err(MusterError::Config(format!(
                "instance.health_check.interval_secs must be between 1 and {}",
                MAX_HEARTBEAT_INTERVAL_SECS
            )));
        }
        if self.lock.retry_interval_ms == 0 {
            return Err(MusterError::Config(
                "lock.retry_interval_ms must be greater than zero".into(),
            ));
        }
        if self.registry.backend == RegistryBackend::Postgres && self.database.url.is_empty() {
            return Err(MusterError::Config(
                "database.url is required for the postgres registry backend".into(),
            ));
        }
        Ok(())
    }
}

/// Static identity of the service this node belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Deployment environment (empty means the registry default).
    #[serde(default)]
    pub environment: String,

    /// Application the service belongs to.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Service name.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Service version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Free-form description stored with the service record.
    #[serde(default)]
    pub description: String,

    /// Service level (e.g. "BACK", "FRONT").
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: String::new(),
            app_id: default_app_id(),
            name: default_service_name(),
            version: default_version(),
            description: String::new(),
            level: default_level(),
        }
    }
}

fn default_app_id() -> String {
    "default".to_string()
}

fn default_service_name() -> String {
    "MUSTER".to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_level() -> String {
    "BACK".to_string()
}

/// Instance record configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Host name reported to the registry (empty resolves the local host name).
    #[serde(default)]
    pub host_name: String,

    /// Endpoints this instance serves on, e.g. `rest://10.0.0.1:30100`.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Extra instance properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Liveness settings.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// Instance liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Who drives liveness.
    #[serde(default)]
    pub mode: HealthCheckMode,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Missed heartbeats tolerated before the registry evicts the instance.
    #[serde(default = "default_heartbeat_times")]
    pub times: u32,
}

impl HealthCheckConfig {
    /// Heartbeat interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// How long the registry keeps an instance without a heartbeat.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(
            self.interval_secs
                .saturating_mul(u64::from(self.times).saturating_add(1)),
        )
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::default(),
            interval_secs: default_heartbeat_interval(),
            times: default_heartbeat_times(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_times() -> u32 {
    3
}

/// Health check mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// The instance pushes heartbeats.
    #[default]
    Push,

    /// The registry polls the instance.
    Pull,
}

impl HealthCheckMode {
    /// Convert to string for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// Registry scope and backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Tenant domain the node registers itself under.
    #[serde(default = "default_scope")]
    pub domain: String,

    /// Tenant project the node registers itself under.
    #[serde(default = "default_scope")]
    pub project: String,

    /// Backing store.
    #[serde(default)]
    pub backend: RegistryBackend,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            domain: default_scope(),
            project: default_scope(),
            backend: RegistryBackend::default(),
        }
    }
}

fn default_scope() -> String {
    "default".to_string()
}

/// Registry backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// PostgreSQL tables with advisory locks.
    #[default]
    Postgres,

    /// Process-local store for single-node development.
    Memory,
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
