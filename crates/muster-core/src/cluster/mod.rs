mod identity;
mod lock;
mod registry;
mod version;

pub use identity::{
    HealthCheck, InstanceIdentity, ProcessIdentity, RegistrationState, ServiceIdentity,
    ServiceKey,
};
pub use lock::{DistributedLock, LockLease};
pub use registry::{
    BoxFuture, CreateServiceResponse, ExistResponse, GetServiceResponse, ListInstancesResponse,
    RegisterInstanceResponse, RegistryClient, RegistryScope, ResponseCode, ResponseStatus,
};
pub use version::{compare_versions, ServerInfo, VersionStore};
