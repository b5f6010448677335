use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use muster_core::cluster::{
    BoxFuture, CreateServiceResponse, ExistResponse, GetServiceResponse, InstanceIdentity,
    ListInstancesResponse, RegisterInstanceResponse, RegistryClient, RegistryScope, ResponseCode,
    ResponseStatus, ServiceIdentity, ServiceKey,
};
use muster_core::error::{MusterError, Result};

/// Registry operation, recorded in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryCall {
    Exist,
    GetService,
    CreateService,
    RegisterInstance,
    Heartbeat,
    UnregisterInstance,
    ListInstances,
}

/// Injected outcome for the next call of a given kind.
#[derive(Debug, Clone)]
pub enum RegistryFailure {
    /// The call fails before reaching the registry.
    Transport(String),
    /// The registry answers with a non-success status.
    Reject(ResponseCode, String),
}

#[derive(Default)]
struct State {
    services: HashMap<(RegistryScope, String), ServiceIdentity>,
    instances: HashMap<(RegistryScope, String), InstanceIdentity>,
    heartbeats: HashMap<String, usize>,
    calls: Vec<RegistryCall>,
    failures: HashMap<RegistryCall, VecDeque<RegistryFailure>>,
}

/// Process-local registry.
///
/// Records every call and lets callers inject failures or drop instances
/// the way a compacted or restarted registry would.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `call` fail.
    pub fn fail_next(&self, call: RegistryCall, failure: RegistryFailure) {
        self.lock()
            .failures
            .entry(call)
            .or_default()
            .push_back(failure);
    }

    /// Insert a service record with a caller-chosen id.
    pub fn insert_service(&self, scope: &RegistryScope, service: ServiceIdentity) {
        self.lock()
            .services
            .insert((scope.clone(), service.service_id.clone()), service);
    }

    /// Drop every instance record.
    pub fn evict_all_instances(&self) {
        self.lock().instances.clear();
    }

    /// Drop one instance record. Returns whether it existed.
    pub fn evict_instance(&self, scope: &RegistryScope, instance_id: &str) -> bool {
        self.lock()
            .instances
            .remove(&(scope.clone(), instance_id.to_string()))
            .is_some()
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of one kind.
    pub fn count(&self, call: RegistryCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Successful heartbeats received for an instance.
    pub fn heartbeats_for(&self, instance_id: &str) -> usize {
        self.lock()
            .heartbeats
            .get(instance_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn service_count(&self) -> usize {
        self.lock().services.len()
    }

    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and pop an injected failure for it.
    fn enter(&self, call: RegistryCall) -> Result<Option<ResponseStatus>> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.failures.get_mut(&call).and_then(|q| q.pop_front()) {
            Some(RegistryFailure::Transport(message)) => Err(MusterError::Transport(message)),
            Some(RegistryFailure::Reject(code, message)) => {
                Ok(Some(ResponseStatus::failure(code, message)))
            }
            None => Ok(None),
        }
    }

    fn do_exist(&self, scope: &RegistryScope, key: &ServiceKey) -> Result<ExistResponse> {
        if let Some(status) = self.enter(RegistryCall::Exist)? {
            return Ok(ExistResponse {
                status,
                service_id: String::new(),
            });
        }

        let state = self.lock();
        let found = state
            .services
            .iter()
            .find(|((s, _), service)| s == scope && service.key() == *key)
            .map(|((_, id), _)| id.clone());

        Ok(match found {
            Some(service_id) => ExistResponse {
                status: ResponseStatus::success(),
                service_id,
            },
            None => ExistResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceNotExists,
                    format!("service {} does not exist", key),
                ),
                service_id: String::new(),
            },
        })
    }

    fn do_get_service(&self, scope: &RegistryScope, service_id: &str) -> Result<GetServiceResponse> {
        if let Some(status) = self.enter(RegistryCall::GetService)? {
            return Ok(GetServiceResponse {
                status,
                service: None,
            });
        }

        let state = self.lock();
        Ok(
            match state.services.get(&(scope.clone(), service_id.to_string())) {
                Some(service) => GetServiceResponse {
                    status: ResponseStatus::success(),
                    service: Some(service.clone()),
                },
                None => GetServiceResponse {
                    status: ResponseStatus::failure(
                        ResponseCode::ServiceNotExists,
                        format!("service {} does not exist", service_id),
                    ),
                    service: None,
                },
            },
        )
    }

    fn do_create_service(
        &self,
        scope: &RegistryScope,
        service: &ServiceIdentity,
    ) -> Result<CreateServiceResponse> {
        if let Some(status) = self.enter(RegistryCall::CreateService)? {
            return Ok(CreateServiceResponse {
                status,
                service_id: String::new(),
            });
        }

        let mut state = self.lock();
        let key = service.key();
        let duplicate = state
            .services
            .iter()
            .any(|((s, _), existing)| s == scope && existing.key() == key);
        if duplicate {
            return Ok(CreateServiceResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceAlreadyExists,
                    format!("service {} already exists", key),
                ),
                service_id: String::new(),
            });
        }

        let service_id = new_id();
        let mut record = service.clone();
        record.service_id = service_id.clone();
        state
            .services
            .insert((scope.clone(), service_id.clone()), record);

        Ok(CreateServiceResponse {
            status: ResponseStatus::success(),
            service_id,
        })
    }

    fn do_register_instance(
        &self,
        scope: &RegistryScope,
        instance: &InstanceIdentity,
    ) -> Result<RegisterInstanceResponse> {
        if let Some(status) = self.enter(RegistryCall::RegisterInstance)? {
            return Ok(RegisterInstanceResponse {
                status,
                instance_id: String::new(),
            });
        }

        let mut state = self.lock();
        if !state
            .services
            .contains_key(&(scope.clone(), instance.service_id.clone()))
        {
            return Ok(RegisterInstanceResponse {
                status: ResponseStatus::failure(
                    ResponseCode::ServiceNotExists,
                    format!("service {} does not exist", instance.service_id),
                ),
                instance_id: String::new(),
            });
        }

        let instance_id = new_id();
        let mut record = instance.clone();
        record.instance_id = instance_id.clone();
        state
            .instances
            .insert((scope.clone(), instance_id.clone()), record);

        Ok(RegisterInstanceResponse {
            status: ResponseStatus::success(),
            instance_id,
        })
    }

    fn do_heartbeat(
        &self,
        scope: &RegistryScope,
        service_id: &str,
        instance_id: &str,
    ) -> Result<ResponseStatus> {
        if let Some(status) = self.enter(RegistryCall::Heartbeat)? {
            return Ok(status);
        }

        let mut state = self.lock();
        let live = state
            .instances
            .get(&(scope.clone(), instance_id.to_string()))
            .is_some_and(|i| i.service_id == service_id);
        if !live {
            return Ok(instance_missing(service_id, instance_id));
        }

        *state.heartbeats.entry(instance_id.to_string()).or_default() += 1;
        Ok(ResponseStatus::success())
    }

    fn do_unregister_instance(
        &self,
        scope: &RegistryScope,
        service_id: &str,
        instance_id: &str,
    ) -> Result<ResponseStatus> {
        if let Some(status) = self.enter(RegistryCall::UnregisterInstance)? {
            return Ok(status);
        }

        let mut state = self.lock();
        let key = (scope.clone(), instance_id.to_string());
        match state.instances.get(&key) {
            Some(instance) if instance.service_id == service_id => {
                state.instances.remove(&key);
                Ok(ResponseStatus::success())
            }
            _ => Ok(instance_missing(service_id, instance_id)),
        }
    }

    fn do_list_instances(
        &self,
        scope: &RegistryScope,
        service_id: &str,
    ) -> Result<ListInstancesResponse> {
        if let Some(status) = self.enter(RegistryCall::ListInstances)? {
            return Ok(ListInstancesResponse {
                status,
                instances: Vec::new(),
            });
        }

        let state = self.lock();
        let instances = state
            .instances
            .iter()
            .filter(|((s, _), i)| s == scope && i.service_id == service_id)
            .map(|(_, i)| i.clone())
            .collect();

        Ok(ListInstancesResponse {
            status: ResponseStatus::success(),
            instances,
        })
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn instance_missing(service_id: &str, instance_id: &str) -> ResponseStatus {
    ResponseStatus::failure(
        ResponseCode::InstanceNotExists,
        format!("instance {}/{} does not exist", service_id, instance_id),
    )
}

impl RegistryClient for MemoryRegistry {
    fn exist<'a>(
        &'a self,
        scope: &'a RegistryScope,
        key: &'a ServiceKey,
    ) -> BoxFuture<'a, Result<ExistResponse>> {
        Box::pin(async move { self.do_exist(scope, key) })
    }

    fn get_service<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<GetServiceResponse>> {
        Box::pin(async move { self.do_get_service(scope, service_id) })
    }

    fn create_service<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service: &'a ServiceIdentity,
    ) -> BoxFuture<'a, Result<CreateServiceResponse>> {
        Box::pin(async move { self.do_create_service(scope, service) })
    }

    fn register_instance<'a>(
        &'a self,
        scope: &'a RegistryScope,
        instance: &'a InstanceIdentity,
    ) -> BoxFuture<'a, Result<RegisterInstanceResponse>> {
        Box::pin(async move { self.do_register_instance(scope, instance) })
    }

    fn heartbeat<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<ResponseStatus>> {
        Box::pin(async move { self.do_heartbeat(scope, service_id, instance_id) })
    }

    fn unregister_instance<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<ResponseStatus>> {
        Box::pin(async move { self.do_unregister_instance(scope, service_id, instance_id) })
    }

    fn list_instances<'a>(
        &'a self,
        scope: &'a RegistryScope,
        service_id: &'a str,
    ) -> BoxFuture<'a, Result<ListInstancesResponse>> {
        Box::pin(async move { self.do_list_instances(scope, service_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_core::config::MusterConfig;

    fn service() -> ServiceIdentity {
        ServiceIdentity::from_config(&MusterConfig::default().service)
    }

    #[tokio::test]
    async fn test_create_then_exist() {
        let registry = MemoryRegistry::new();
        let scope = RegistryScope::default();
        let svc = service();

        let created = registry.create_service(&scope, &svc).await.unwrap();
        assert!(created.status.is_success());

        let exist = registry.exist(&scope, &svc.key()).await.unwrap();
        assert!(exist.status.is_success());
        assert_eq!(exist.service_id, created.service_id);

        let dup = registry.create_service(&scope, &svc).await.unwrap();
        assert_eq!(dup.status.code, ResponseCode::ServiceAlreadyExists);
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let registry = MemoryRegistry::new();
        let svc = service();
        registry
            .create_service(&RegistryScope::default(), &svc)
            .await
            .unwrap();

        let other = RegistryScope::new("tenant", "project");
        let exist = registry.exist(&other, &svc.key()).await.unwrap();
        assert_eq!(exist.status.code, ResponseCode::ServiceNotExists);
    }

    #[tokio::test]
    async fn test_instance_requires_service() {
        let registry = MemoryRegistry::new();
        let instance =
            InstanceIdentity::from_config(&MusterConfig::default().instance, "node-a");

        let resp = registry
            .register_instance(&RegistryScope::default(), &instance)
            .await
            .unwrap();
        assert_eq!(resp.status.code, ResponseCode::ServiceNotExists);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let registry = MemoryRegistry::new();
        let scope = RegistryScope::default();
        let key = service().key();
        registry.fail_next(RegistryCall::Exist, RegistryFailure::Transport("down".into()));
        registry.fail_next(
            RegistryCall::Exist,
            RegistryFailure::Reject(ResponseCode::Unavailable, "busy".into()),
        );

        assert!(registry.exist(&scope, &key).await.is_err());
        let second = registry.exist(&scope, &key).await.unwrap();
        assert_eq!(second.status.code, ResponseCode::Unavailable);
        let third = registry.exist(&scope, &key).await.unwrap();
        assert_eq!(third.status.code, ResponseCode::ServiceNotExists);
        assert_eq!(registry.count(RegistryCall::Exist), 3);
    }

    #[tokio::test]
    async fn test_heartbeat_after_eviction() {
        let registry = MemoryRegistry::new();
        let scope = RegistryScope::default();
        let created = registry.create_service(&scope, &service()).await.unwrap();
        let mut instance =
            InstanceIdentity::from_config(&MusterConfig::default().instance, "node-a");
        instance.service_id = created.service_id.clone();
        let registered = registry.register_instance(&scope, &instance).await.unwrap();

        let ok = registry
            .heartbeat(&scope, &created.service_id, &registered.instance_id)
            .await
            .unwrap();
        assert!(ok.is_success());
        assert_eq!(registry.heartbeats_for(&registered.instance_id), 1);

        assert!(registry.evict_instance(&scope, &registered.instance_id));
        let gone = registry
            .heartbeat(&scope, &created.service_id, &registered.instance_id)
            .await
            .unwrap();
        assert_eq!(gone.code, ResponseCode::InstanceNotExists);
    }
}
