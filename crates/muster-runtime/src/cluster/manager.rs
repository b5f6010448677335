use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use muster_core::cluster::{
    InstanceIdentity, ProcessIdentity, RegistrationState, RegistryClient, RegistryScope,
    ResponseCode,
};
use muster_core::error::{MusterError, Result};

use super::heartbeat::{self, HeartbeatHandle};

/// Registers this node into the registry it serves and keeps it there.
///
/// The manager is the only owner of the process identity. While the
/// heartbeat loop runs, the manager lives inside that task and comes back
/// from [`HeartbeatHandle::stop`].
pub struct SelfRegistrationManager {
    registry: Arc<dyn RegistryClient>,
    scope: RegistryScope,
    identity: ProcessIdentity,
    identity_tx: watch::Sender<ProcessIdentity>,
}

impl SelfRegistrationManager {
    /// Create a manager for an unregistered identity.
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        scope: RegistryScope,
        identity: ProcessIdentity,
    ) -> Self {
        let (identity_tx, _) = watch::channel(identity.clone());
        Self {
            registry,
            scope,
            identity,
            identity_tx,
        }
    }

    /// Current identity.
    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Current registration state.
    pub fn state(&self) -> RegistrationState {
        self.identity.state
    }

    /// Registry scope used for every call.
    pub fn scope(&self) -> &RegistryScope {
        &self.scope
    }

    /// Watch identity changes, including those made by the heartbeat loop.
    pub fn subscribe(&self) -> watch::Receiver<ProcessIdentity> {
        self.identity_tx.subscribe()
    }

    /// Interval between heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.identity.instance.health_check.interval.max(1))
    }

    /// Register service and instance, then start the heartbeat loop.
    ///
    /// Does not retry: recovering from later losses is the loop's job.
    pub async fn self_register(mut self, shutdown: CancellationToken) -> Result<HeartbeatHandle> {
        self.register().await?;
        Ok(heartbeat::spawn(self, shutdown))
    }

    /// Register the service record, then the instance record.
    pub async fn register(&mut self) -> Result<()> {
        self.set_state(RegistrationState::Registering);

        let result = match self.register_service().await {
            Ok(()) => self.register_instance().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => self.set_state(RegistrationState::Registered),
            Err(_) => self.set_state(RegistrationState::Unregistered),
        }
        result
    }

    /// Adopt an existing service record or create one.
    pub async fn register_service(&mut self) -> Result<()> {
        let key = self.identity.service.key();
        let exist = self.registry.exist(&self.scope, &key).await.map_err(|e| {
            error!(service = %key, "Query service existence failed: {}", e);
            e
        })?;

        if exist.status.is_success() {
            warn!(service_id = %exist.service_id, "Service {} already registered", key);
            return self.adopt_service(exist.service_id).await;
        }
        debug!(service = %key, code = %exist.status.code, "Service not registered yet");

        let created = self
            .registry
            .create_service(&self.scope, &self.identity.service)
            .await
            .map_err(|e| {
                error!(service = %key, "Register service failed: {}", e);
                e
            })?;

        if created.status.code == ResponseCode::ServiceAlreadyExists {
            // Another node created the record after our existence query.
            let exist = self.registry.exist(&self.scope, &key).await?;
            if exist.status.is_success() {
                warn!(service_id = %exist.service_id, "Service {} created concurrently", key);
                return self.adopt_service(exist.service_id).await;
            }
        }

        if !created.status.is_success() {
            error!(
                service = %key,
                code = %created.status.code,
                "Register service failed: {}",
                created.status.message
            );
            return Err(MusterError::rejected(
                created.status.code.as_str(),
                created.status.message,
            ));
        }

        self.identity.service.service_id = created.service_id;
        self.publish();
        info!(service_id = %self.identity.service.service_id, "Registered service {}", key);
        Ok(())
    }

    async fn adopt_service(&mut self, service_id: String) -> Result<()> {
        let record = match self.registry.get_service(&self.scope, &service_id).await {
            Ok(resp) if resp.status.is_success() => resp.service,
            Ok(resp) => {
                error!(
                    service_id = %service_id,
                    code = %resp.status.code,
                    "Query service info failed: {}",
                    resp.status.message
                );
                None
            }
            Err(e) => {
                error!(service_id = %service_id, "Query service info failed: {}", e);
                None
            }
        };

        let Some(mut service) = record else {
            return Err(MusterError::ServiceNotFound(service_id));
        };
        service.service_id = service_id;
        self.identity.service = service;
        self.publish();
        Ok(())
    }

    /// Create a fresh instance record under the current service.
    pub async fn register_instance(&mut self) -> Result<()> {
        self.identity.instance.instance_id.clear();
        self.identity.instance.service_id = self.identity.service.service_id.clone();
        self.publish();

        let service_id = self.identity.instance.service_id.clone();
        let resp = self
            .registry
            .register_instance(&self.scope, &self.identity.instance)
            .await
            .map_err(|e| {
                error!(service_id = %service_id, "Register instance failed: {}", e);
                e
            })?;

        if !resp.status.is_success() {
            error!(
                service_id = %service_id,
                code = %resp.status.code,
                "Register instance failed: {}",
                resp.status.message
            );
            return Err(MusterError::rejected(
                resp.status.code.as_str(),
                resp.status.message,
            ));
        }

        self.identity.instance.instance_id = resp.instance_id;
        self.publish();
        info!(
            service_id = %service_id,
            instance_id = %self.identity.instance.instance_id,
            endpoints = ?self.identity.instance.endpoints,
            "Registered instance"
        );
        Ok(())
    }

    /// Renew the lease of the current instance. Never mutates identity.
    pub async fn heartbeat(&self) -> Result<()> {
        let instance = &self.identity.instance;
        let status = self
            .registry
            .heartbeat(&self.scope, &instance.service_id, &instance.instance_id)
            .await
            .map_err(|e| {
                error!(
                    service_id = %instance.service_id,
                    instance_id = %instance.instance_id,
                    "Send heartbeat failed: {}",
                    e
                );
                e
            })?;

        if status.is_success() {
            debug!(
                service_id = %instance.service_id,
                instance_id = %instance.instance_id,
                "Heartbeat renewed"
            );
            return Ok(());
        }

        error!(
            service_id = %instance.service_id,
            instance_id = %instance.instance_id,
            code = %status.code,
            "Heartbeat rejected: {}",
            status.message
        );
        Err(MusterError::rejected(status.code.as_str(), status.message))
    }

    /// Remove the instance record. A no-op when nothing is registered.
    pub async fn self_unregister(&mut self) -> Result<()> {
        if !self.identity.instance.is_registered() {
            return Ok(());
        }
        self.set_state(RegistrationState::Unregistering);

        let service_id = self.identity.instance.service_id.clone();
        let instance_id = self.identity.instance.instance_id.clone();
        let result = self
            .registry
            .unregister_instance(&self.scope, &service_id, &instance_id)
            .await
            .and_then(|status| status.into_result());

        match result {
            Ok(()) => {
                self.identity.instance.instance_id.clear();
                self.set_state(RegistrationState::Unregistered);
                warn!(service_id = %service_id, instance_id = %instance_id, "Unregistered instance");
                Ok(())
            }
            Err(e) => {
                self.set_state(RegistrationState::Registered);
                error!(
                    service_id = %service_id,
                    instance_id = %instance_id,
                    "Unregister instance failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Instances registered under this node's own service.
    pub async fn cluster_members(&self) -> Result<Vec<InstanceIdentity>> {
        let service_id = &self.identity.service.service_id;
        if service_id.is_empty() {
            return Err(MusterError::ServiceNotFound(
                self.identity.service.key().to_string(),
            ));
        }

        let resp = self.registry.list_instances(&self.scope, service_id).await?;
        if !resp.status.is_success() {
            return Err(MusterError::rejected(
                resp.status.code.as_str(),
                resp.status.message,
            ));
        }
        Ok(resp.instances)
    }

    pub(crate) fn set_state(&mut self, state: RegistrationState) {
        self.identity.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.identity_tx.send_replace(self.identity.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryRegistry, RegistryCall, RegistryFailure};
    use muster_core::cluster::ServiceIdentity;
    use muster_core::config::MusterConfig;

    fn local_identity() -> ProcessIdentity {
        let mut config = MusterConfig::default();
        config.service.environment = "testing".into();
        config.service.name = "service-center".into();
        config.service.version = "2.0.0".into();
        config.instance.endpoints = vec!["rest://127.0.0.1:30100".into()];
        ProcessIdentity::from_config(&config.service, &config.instance, "node-a")
    }

    fn manager(registry: &Arc<MemoryRegistry>) -> SelfRegistrationManager {
        SelfRegistrationManager::new(
            registry.clone(),
            RegistryScope::default(),
            local_identity(),
        )
    }

    #[tokio::test]
    async fn test_register_creates_service_and_instance() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);

        manager.register().await.unwrap();

        assert!(manager.identity().service.is_registered());
        assert!(manager.identity().instance.is_registered());
        assert_eq!(
            manager.identity().instance.service_id,
            manager.identity().service.service_id
        );
        assert_eq!(manager.state(), RegistrationState::Registered);
        assert_eq!(registry.count(RegistryCall::CreateService), 1);
        assert_eq!(registry.count(RegistryCall::RegisterInstance), 1);
    }

    #[tokio::test]
    async fn test_register_twice_reuses_service() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);

        manager.register().await.unwrap();
        let first = manager.identity().service.service_id.clone();
        manager.register().await.unwrap();

        assert_eq!(manager.identity().service.service_id, first);
        assert_eq!(registry.count(RegistryCall::CreateService), 1);
        assert_eq!(registry.count(RegistryCall::GetService), 1);
    }

    #[tokio::test]
    async fn test_existing_service_is_adopted() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut existing = local_identity().service;
        existing.service_id = "S1".into();
        existing.description = "seeded".into();
        registry.insert_service(&RegistryScope::default(), existing);

        let mut manager = manager(&registry);
        manager.register_service().await.unwrap();

        assert_eq!(manager.identity().service.service_id, "S1");
        assert_eq!(manager.identity().service.description, "seeded");
        assert_eq!(registry.count(RegistryCall::CreateService), 0);
    }

    #[tokio::test]
    async fn test_existing_service_lookup_failure_is_not_found() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut existing = local_identity().service;
        existing.service_id = "S1".into();
        registry.insert_service(&RegistryScope::default(), existing);
        registry.fail_next(
            RegistryCall::GetService,
            RegistryFailure::Transport("connection reset".into()),
        );

        let mut manager = manager(&registry);
        let err = manager.register_service().await.unwrap_err();

        assert!(matches!(err, MusterError::ServiceNotFound(ref id) if id == "S1"));
        assert!(!manager.identity().service.is_registered());
    }

    #[tokio::test]
    async fn test_concurrently_created_service_is_adopted() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut existing = local_identity().service;
        existing.service_id = "S1".into();
        registry.insert_service(&RegistryScope::default(), existing);
        // The first query misses the record another node is creating.
        registry.fail_next(
            RegistryCall::Exist,
            RegistryFailure::Reject(ResponseCode::ServiceNotExists, "not found".into()),
        );

        let mut manager = manager(&registry);
        manager.register().await.unwrap();

        assert_eq!(manager.identity().service.service_id, "S1");
        assert_eq!(manager.identity().instance.service_id, "S1");
        assert_eq!(manager.state(), RegistrationState::Registered);
        assert_eq!(registry.count(RegistryCall::CreateService), 1);
        assert_eq!(registry.count(RegistryCall::Exist), 2);
        assert_eq!(registry.service_count(), 1);
    }

    #[tokio::test]
    async fn test_create_rejection_surfaces_message() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.fail_next(
            RegistryCall::CreateService,
            RegistryFailure::Reject(ResponseCode::InvalidParams, "bad service name".into()),
        );

        let mut manager = manager(&registry);
        let err = manager.register().await.unwrap_err();

        match err {
            MusterError::Rejected { message, .. } => assert_eq!(message, "bad service name"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.count(RegistryCall::RegisterInstance), 0);
        assert_eq!(manager.state(), RegistrationState::Unregistered);
    }

    #[tokio::test]
    async fn test_instance_rejection_leaves_instance_unregistered() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);
        manager.register().await.unwrap();

        registry.fail_next(
            RegistryCall::RegisterInstance,
            RegistryFailure::Reject(ResponseCode::Internal, "quota exceeded".into()),
        );
        let err = manager.register_instance().await.unwrap_err();

        assert!(err.is_rejected());
        assert!(!manager.identity().instance.is_registered());
    }

    #[tokio::test]
    async fn test_heartbeat_failure_does_not_mutate_identity() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);
        manager.register().await.unwrap();
        let before = manager.identity().clone();

        registry.evict_all_instances();
        let err = manager.heartbeat().await.unwrap_err();

        match err {
            MusterError::Rejected { code, .. } => assert_eq!(code, "INSTANCE_NOT_EXISTS"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.identity(), &before);
    }

    #[tokio::test]
    async fn test_unregister_without_instance_is_noop() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);

        manager.self_unregister().await.unwrap();
        manager.self_unregister().await.unwrap();

        assert_eq!(registry.count(RegistryCall::UnregisterInstance), 0);
    }

    #[tokio::test]
    async fn test_unregister_removes_instance() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);
        manager.register().await.unwrap();

        manager.self_unregister().await.unwrap();

        assert!(!manager.identity().instance.is_registered());
        assert_eq!(manager.state(), RegistrationState::Unregistered);
        assert_eq!(registry.instance_count(), 0);

        // Second call is a no-op.
        manager.self_unregister().await.unwrap();
        assert_eq!(registry.count(RegistryCall::UnregisterInstance), 1);
    }

    #[tokio::test]
    async fn test_unregister_rejection_is_reported() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);
        manager.register().await.unwrap();
        registry.evict_all_instances();

        let err = manager.self_unregister().await.unwrap_err();

        assert!(err.is_rejected());
        assert!(manager.identity().instance.is_registered());
    }

    #[tokio::test]
    async fn test_cluster_members() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut first = manager(&registry);
        first.register().await.unwrap();
        let mut second = SelfRegistrationManager::new(registry.clone(), RegistryScope::default(), {
            let mut id = local_identity();
            id.instance.host_name = "node-b".into();
            id
        });
        second.register().await.unwrap();

        let members = first.cluster_members().await.unwrap();
        let mut hosts: Vec<_> = members.iter().map(|m| m.host_name.as_str()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["node-a", "node-b"]);
    }

    #[tokio::test]
    async fn test_cluster_members_requires_service() {
        let registry = Arc::new(MemoryRegistry::new());
        let manager = manager(&registry);
        let err = manager.cluster_members().await.unwrap_err();
        assert!(matches!(err, MusterError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_subscribers_see_new_instance_id() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut manager = manager(&registry);
        let rx = manager.subscribe();

        manager.register().await.unwrap();

        let seen = rx.borrow().clone();
        assert_eq!(seen.instance.instance_id, manager.identity().instance.instance_id);
        assert_eq!(seen.state, RegistrationState::Registered);
    }

    #[test]
    fn test_service_identity_key_matches_config() {
        let id: ServiceIdentity = local_identity().service;
        assert_eq!(id.key().service_name, "service-center");
    }
}
