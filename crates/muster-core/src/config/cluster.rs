use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the cluster-wide lock guarding version upgrades.
pub const GLOBAL_LOCK_NAME: &str = "/muster/locks/global";

/// Well-known key of the persisted cluster version record.
pub const SERVER_INFO_KEY: &str = "/muster/server/info";

/// Global lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock name.
    #[serde(default = "default_lock_name")]
    pub name: String,

    /// Give up acquiring after this many seconds. Unset waits indefinitely.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,

    /// First retry delay while the lock is contended, in milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Retry delay ceiling, in milliseconds.
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval_ms: u64,
}

impl LockConfig {
    /// Acquire timeout as a duration, if bounded.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }

    /// Initial retry delay, never below one millisecond.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    /// Maximum retry delay.
    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_millis(self.max_retry_interval_ms.max(self.retry_interval_ms.max(1)))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            acquire_timeout_secs: None,
            retry_interval_ms: default_retry_interval(),
            max_retry_interval_ms: default_max_retry_interval(),
        }
    }
}

fn default_lock_name() -> String {
    GLOBAL_LOCK_NAME.to_string()
}

fn default_retry_interval() -> u64 {
    100
}

fn default_max_retry_interval() -> u64 {
    5_000
}

/// Version upgrade configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Run the upgrade check on startup.
    #[serde(default = "default_upgrade_enabled")]
    pub enabled: bool,

    /// Key of the persisted version record.
    #[serde(default = "default_record_key")]
    pub record_key: String,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: default_upgrade_enabled(),
            record_key: default_record_key(),
        }
    }
}

fn default_upgrade_enabled() -> bool {
    true
}

fn default_record_key() -> String {
    SERVER_INFO_KEY.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lock_config() {
        let config = LockConfig::default();
        assert_eq!(config.name, GLOBAL_LOCK_NAME);
        assert!(config.acquire_timeout().is_none());
        assert_eq!(config.retry_interval(), Duration::from_millis(100));
        assert_eq!(config.max_retry_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_max_retry_never_below_initial() {
        let config = LockConfig {
            retry_interval_ms: 800,
            max_retry_interval_ms: 200,
            ..Default::default()
        };
        assert_eq!(config.max_retry_interval(), Duration::from_millis(800));
    }

    #[test]
    fn test_zero_retry_interval_still_backs_off() {
        let config = LockConfig {
            retry_interval_ms: 0,
            max_retry_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.retry_interval(), Duration::from_millis(1));
        assert_eq!(config.max_retry_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_parse_upgrade_config() {
        let toml = r#"
            enabled = false
            record_key = "/custom/version"
        "#;

        let config: UpgradeConfig = toml::from_str(toml).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.record_key, "/custom/version");
    }
}
