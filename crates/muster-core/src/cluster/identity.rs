use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{HealthCheckMode, InstanceConfig, ServiceConfig};

/// Lookup key of a service record: everything but the registry-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub environment: String,
    pub app_id: String,
    pub service_name: String,
    pub version: String,
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.environment, self.app_id, self.service_name, self.version
        )
    }
}

/// The service this node registers itself as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Registry-assigned id. Empty until registered.
    #[serde(default)]
    pub service_id: String,
    pub environment: String,
    pub app_id: String,
    pub service_name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub level: String,
}

impl ServiceIdentity {
    /// Build the unregistered identity from static configuration.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            service_id: String::new(),
            environment: config.environment.clone(),
            app_id: config.app_id.clone(),
            service_name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            level: config.level.clone(),
        }
    }

    /// The lookup key for existence checks.
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            environment: self.environment.clone(),
            app_id: self.app_id.clone(),
            service_name: self.service_name.clone(),
            version: self.version.clone(),
        }
    }

    /// Whether the registry has assigned an id.
    pub fn is_registered(&self) -> bool {
        !self.service_id.is_empty()
    }
}

/// Instance liveness settings carried on the instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub mode: HealthCheckMode,
    /// Heartbeat interval in seconds.
    pub interval: u64,
    /// Missed heartbeats tolerated before eviction.
    pub times: u32,
}

/// One running process of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    /// Owning service id.
    #[serde(default)]
    pub service_id: String,
    /// Registry-assigned id. Empty means "not currently registered".
    #[serde(default)]
    pub instance_id: String,
    pub host_name: String,
    pub endpoints: Vec<String>,
    pub health_check: HealthCheck,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl InstanceIdentity {
    /// Build the unregistered instance from configuration.
    pub fn from_config(config: &InstanceConfig, host_name: impl Into<String>) -> Self {
        Self {
            service_id: String::new(),
            instance_id: String::new(),
            host_name: host_name.into(),
            endpoints: config.endpoints.clone(),
            health_check: HealthCheck {
                mode: config.health_check.mode,
                interval: config.health_check.interval_secs,
                times: config.health_check.times,
            },
            properties: config.properties.clone(),
        }
    }

    /// Whether this instance is currently registered.
    pub fn is_registered(&self) -> bool {
        !self.instance_id.is_empty()
    }

    /// Seconds the registry keeps this instance without a heartbeat.
    pub fn lease_secs(&self) -> u64 {
        self.health_check
            .interval
            .saturating_mul(u64::from(self.health_check.times).saturating_add(1))
    }
}

/// Registration lifecycle of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    HeartbeatFailed,
    Unregistering,
}

impl RegistrationState {
    /// Convert to string for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Registered => "registered",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::Unregistering => "unregistering",
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The single active identity of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub service: ServiceIdentity,
    pub instance: InstanceIdentity,
    pub state: RegistrationState,
}

impl ProcessIdentity {
    /// Create an unregistered identity.
    pub fn new(service: ServiceIdentity, instance: InstanceIdentity) -> Self {
        Self {
            service,
            instance,
            state: RegistrationState::Unregistered,
        }
    }

    /// Build from configuration.
    pub fn from_config(
        service: &ServiceConfig,
        instance: &InstanceConfig,
        host_name: impl Into<String>,
    ) -> Self {
        Self::new(
            ServiceIdentity::from_config(service),
            InstanceIdentity::from_config(instance, host_name),
        )
    }
}
