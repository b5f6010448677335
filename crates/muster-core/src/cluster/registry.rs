use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::identity::{InstanceIdentity, ServiceIdentity, ServiceKey};
use crate::config::RegistryConfig;
use crate::error::{MusterError, Result};

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Registry response code. `Success` is the only code that means the request took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Success,
    ServiceNotExists,
    InstanceNotExists,
    ServiceAlreadyExists,
    InvalidParams,
    Unavailable,
    Internal,
}

impl ResponseCode {
    /// Convert to string for logging and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::ServiceNotExists => "SERVICE_NOT_EXISTS",
            Self::InstanceNotExists => "INSTANCE_NOT_EXISTS",
            Self::ServiceAlreadyExists => "SERVICE_ALREADY_EXISTS",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured outcome of a registry call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: ResponseCode,
    pub message: String,
}

impl ResponseStatus {
    /// A success status.
    pub fn success() -> Self {
        Self {
            code: ResponseCode::Success,
            message: String::new(),
        }
    }

    /// A failure status with a message.
    pub fn failure(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }

    /// Convert a non-success status into a rejection error.
    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(MusterError::rejected(self.code.as_str(), self.message))
        }
    }
}

/// Tenant scope every registry call is made in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryScope {
    pub domain: String,
    pub project: String,
}

impl RegistryScope {
    pub fn new(domain: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            project: project.into(),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(&config.domain, &config.project)
    }
}

impl Default for RegistryScope {
    fn default() -> Self {
        Self::new("default", "default")
    }
}

impl std::fmt::Display for RegistryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.project)
    }
}

/// Result of an existence query.
#[derive(Debug, Clone)]
pub struct ExistResponse {
    pub status: ResponseStatus,
    /// Id of the matching record, set only on success.
    pub service_id: String,
}

/// Result of a lookup by id.
#[derive(Debug, Clone)]
pub struct GetServiceResponse {
    pub status: ResponseStatus,
    pub service: Option<ServiceIdentity>,
}

/// Result of creating a service record.
#[derive(Debug, Clone)]
pub struct CreateServiceResponse {
    pub status: ResponseStatus,
    pub service_id: String,
}

/// Result of creating an instance record.
#[derive(Debug, Clone)]
pub struct RegisterInstanceResponse {
    pub status: ResponseStatus,
    pub instance_id: String,
}

/// Result of listing the instances of a service.
#[derive(Debug, Clone)]
pub struct ListInstancesResponse {
    pub status: ResponseStatus,
    pub instances: Vec<InstanceIdentity>,
}

/// Client side of the service registry.
///
/// `Err` means the call itself failed. A well-formed request the registry
/// refused comes back as `Ok` with a non-success [`ResponseStatus`].
pub trait RegistryClient: Send + Sync + 'static {
    /// Look up a service by its key.
    fn exist<'a>(
        &'a self,
        scope: &'a RegistryScope,
        key: &'a ServiceKey,
    ) -> BoxFuture<'a, Result<ExistResponse>>;

    /// Fetch a service record by id.
    fn get_service<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<GetServiceResponse>>;

    /// Create a service record. The registry assigns the id.
    fn create_service<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service: &'a ServiceIdentity,
    ) -> BoxFuture<'a, Result<CreateServiceResponse>>;

    /// Create an instance record under `instance.service_id`.
    fn register_instance<'a>(
        &'a self,
        scope: &'a RegistryScope,
        instance: &'a InstanceIdentity,
    ) -> BoxFuture<'a, Result<RegisterInstanceResponse>>;

    /// Renew an instance lease.
    fn heartbeat<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<ResponseStatus>>;

    /// Remove an instance record.
    fn unregister_instance<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<ResponseStatus>>;

    /// List live instances of a service.
    fn list_instances<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<ListInstancesResponse>>;
}
