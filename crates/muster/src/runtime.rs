//! MUSTER node runtime.
//!
//! Wires the registry, the global lock and the version store behind one
//! process lifecycle: upgrade the cluster version record, register, keep
//! the lease alive until shutdown, then deregister.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use muster_core::cluster::{
    DistributedLock, ProcessIdentity, RegistryClient, RegistryScope, VersionStore,
};
use muster_core::config::{MusterConfig, RegistryBackend};
use muster_core::error::{MusterError, Result};
use muster_runtime::cluster::FatalHandler;
use muster_runtime::db::Database;
use muster_runtime::memory::{MemoryLock, MemoryRegistry, MemoryVersionStore};
use muster_runtime::postgres::{ensure_schema, PgAdvisoryLock, PgRegistry, PgVersionStore};
use muster_runtime::{SelfRegistrationManager, UpgradeCoordinator};

/// Prelude module for common imports.
pub mod prelude {
    pub use muster_core::cluster::{
        InstanceIdentity, ProcessIdentity, RegistrationState, ServiceIdentity,
    };
    pub use muster_core::config::MusterConfig;
    pub use muster_core::error::{MusterError, Result};

    pub use crate::{Muster, MusterBuilder};
}

/// Backends shared by registration and upgrade.
struct Backends {
    registry: Arc<dyn RegistryClient>,
    lock: Arc<dyn DistributedLock>,
    store: Arc<dyn VersionStore>,
    db: Option<Database>,
}

/// A MUSTER node.
pub struct Muster {
    config: MusterConfig,
    host_name: String,
    version: String,
    registry: Option<Arc<dyn RegistryClient>>,
    lock: Option<Arc<dyn DistributedLock>>,
    store: Option<Arc<dyn VersionStore>>,
    on_fatal: Option<FatalHandler>,
    shutdown: CancellationToken,
    identity_tx: watch::Sender<Option<ProcessIdentity>>,
}

impl Muster {
    /// Create a new builder.
    pub fn builder() -> MusterBuilder {
        MusterBuilder::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &MusterConfig {
        &self.config
    }

    /// Host name this node registers with.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Version this node runs and records.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Token that stops [`Muster::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Watch the registered identity. `None` until registration succeeds.
    pub fn subscribe(&self) -> watch::Receiver<Option<ProcessIdentity>> {
        self.identity_tx.subscribe()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the version upgrade only, without registering.
    pub async fn upgrade(self, force: bool) -> Result<()> {
        let backends = self.backends().await?;
        let coordinator = self.coordinator(&backends);
        let result = if force {
            coordinator.force_upgrade().await
        } else {
            coordinator.upgrade_version().await
        };
        if let Some(db) = &backends.db {
            db.close().await;
        }
        result
    }

    /// Run the node until ctrl-c or [`Muster::shutdown`].
    pub async fn run(self) -> Result<()> {
        info!(
            host = %self.host_name,
            version = %self.version,
            backend = ?self.config.registry.backend,
            "Starting MUSTER node"
        );

        let backends = self.backends().await?;

        if self.config.upgrade.enabled {
            self.coordinator(&backends).upgrade_version().await?;
        }

        let identity = ProcessIdentity::from_config(
            &self.config.service,
            &self.config.instance,
            self.host_name.clone(),
        );
        let manager = SelfRegistrationManager::new(
            backends.registry.clone(),
            RegistryScope::from_config(&self.config.registry),
            identity,
        );

        let heartbeat = manager.self_register(self.shutdown.clone()).await?;
        let mut identity_rx = heartbeat.subscribe();
        self.identity_tx.send_replace(Some(heartbeat.identity()));
        info!(
            service_id = %heartbeat.identity().service.service_id,
            instance_id = %heartbeat.identity().instance.instance_id,
            "Node registered"
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    info!("Received shutdown notification");
                    break;
                }
                changed = identity_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = identity_rx.borrow_and_update().clone();
                    self.identity_tx.send_replace(Some(current));
                }
            }
        }

        self.shutdown.cancel();
        let mut manager = heartbeat.stop().await?;
        if let Err(e) = manager.self_unregister().await {
            warn!("Failed to unregister instance: {}", e);
        }
        self.identity_tx.send_replace(None);

        if let Some(db) = &backends.db {
            db.close().await;
        }
        info!("MUSTER node stopped");
        Ok(())
    }

    fn coordinator(&self, backends: &Backends) -> UpgradeCoordinator {
        let coordinator = UpgradeCoordinator::new(
            backends.store.clone(),
            backends.lock.clone(),
            self.version.clone(),
            &self.config.lock,
            &self.config.upgrade,
        )
        .with_node_name(self.host_name.clone())
        .with_shutdown(self.shutdown.clone());

        match &self.on_fatal {
            Some(handler) => coordinator.with_fatal_handler(handler.clone()),
            None => coordinator,
        }
    }

    /// Injected backends win; the rest come from the configured backend.
    async fn backends(&self) -> Result<Backends> {
        if let (Some(registry), Some(lock), Some(store)) = (&self.registry, &self.lock, &self.store) {
            return Ok(Backends {
                registry: registry.clone(),
                lock: lock.clone(),
                store: store.clone(),
                db: None,
            });
        }

        let mut backends = match self.config.registry.backend {
            RegistryBackend::Memory => Backends {
                registry: Arc::new(MemoryRegistry::new()),
                lock: Arc::new(MemoryLock::new()),
                store: Arc::new(MemoryVersionStore::new()),
                db: None,
            },
            RegistryBackend::Postgres => {
                let db = Database::from_config(&self.config.database).await?;
                db.health_check().await?;
                ensure_schema(db.pool()).await?;
                let pool = db.pool().clone();
                Backends {
                    registry: Arc::new(PgRegistry::new(pool.clone())),
                    lock: Arc::new(PgAdvisoryLock::new(pool.clone(), &self.config.lock)),
                    store: Arc::new(PgVersionStore::new(pool)),
                    db: Some(db),
                }
            }
        };

        if let Some(registry) = &self.registry {
            backends.registry = registry.clone();
        }
        if let Some(lock) = &self.lock {
            backends.lock = lock.clone();
        }
        if let Some(store) = &self.store {
            backends.store = store.clone();
        }
        Ok(backends)
    }
}

/// Builder for a [`Muster`] node.
pub struct MusterBuilder {
    config: Option<MusterConfig>,
    host_name: Option<String>,
    version: Option<String>,
    registry: Option<Arc<dyn RegistryClient>>,
    lock: Option<Arc<dyn DistributedLock>>,
    store: Option<Arc<dyn VersionStore>>,
    on_fatal: Option<FatalHandler>,
    shutdown: Option<CancellationToken>,
}

impl MusterBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            host_name: None,
            version: None,
            registry: None,
            lock: None,
            store: None,
            on_fatal: None,
            shutdown: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: MusterConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the host name. Defaults to the configured one, then the OS host name.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Override the running version. Defaults to this binary's package version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Use this registry instead of the configured backend.
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this global lock instead of the configured backend.
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Use this version store instead of the configured backend.
    pub fn version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the process exit on a failed version write.
    pub fn fatal_handler(mut self, on_fatal: FatalHandler) -> Self {
        self.on_fatal = Some(on_fatal);
        self
    }

    /// Share a shutdown token with the caller.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the node.
    pub fn build(self) -> Result<Muster> {
        let config = self
            .config
            .ok_or_else(|| MusterError::Config("Configuration is required".into()))?;

        let host_name = match self.host_name {
            Some(host_name) => host_name,
            None => resolve_host_name(&config)?,
        };
        let version = self
            .version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        let (identity_tx, _) = watch::channel(None);

        Ok(Muster {
            config,
            host_name,
            version,
            registry: self.registry,
            lock: self.lock,
            store: self.store,
            on_fatal: self.on_fatal,
            shutdown: self.shutdown.unwrap_or_default(),
            identity_tx,
        })
    }
}

impl Default for MusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_host_name(config: &MusterConfig) -> Result<String> {
    if !config.instance.host_name.is_empty() {
        return Ok(config.instance.host_name.clone());
    }
    hostname::get()
        .map_err(MusterError::from)?
        .into_string()
        .map_err(|_| MusterError::Config("Host name is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use muster_core::cluster::{RegistrationState, ServerInfo};
    use muster_runtime::memory::RegistryCall;

    fn memory_config() -> MusterConfig {
        let mut config = MusterConfig::default();
        config.registry.backend = RegistryBackend::Memory;
        config.service.version = "1.2.0".into();
        config
    }

    #[test]
    fn test_builder_requires_config() {
        let result = MusterBuilder::new().host_name("node-a").build();
        assert!(matches!(result, Err(MusterError::Config(_))));
    }

    #[test]
    fn test_builder_defaults() {
        let muster = Muster::builder()
            .config(memory_config())
            .host_name("node-a")
            .build()
            .unwrap();

        assert_eq!(muster.host_name(), "node-a");
        assert_eq!(muster.version(), env!("CARGO_PKG_VERSION"));
        assert!(muster.subscribe().borrow().is_none());
    }

    #[test]
    fn test_running_version_ignores_configured_service_version() {
        let mut config = memory_config();
        config.service.version = "9.9.9".into();

        let muster = Muster::builder()
            .config(config.clone())
            .host_name("node-a")
            .build()
            .unwrap();
        assert_eq!(muster.version(), env!("CARGO_PKG_VERSION"));
        assert_ne!(muster.version(), "9.9.9");

        let pinned = Muster::builder()
            .config(config)
            .host_name("node-a")
            .version("3.0.0")
            .build()
            .unwrap();
        assert_eq!(pinned.version(), "3.0.0");
    }

    #[test]
    fn test_configured_host_name_wins_over_os() {
        let mut config = memory_config();
        config.instance.host_name = "configured".into();

        let muster = Muster::builder().config(config).build().unwrap();
        assert_eq!(muster.host_name(), "configured");
    }

    #[test]
    fn test_os_host_name_fallback() {
        let muster = Muster::builder().config(memory_config()).build().unwrap();
        assert!(!muster.host_name().is_empty());
    }

    #[tokio::test]
    async fn test_run_registers_and_unregisters() {
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(MemoryVersionStore::new());
        let lock = Arc::new(MemoryLock::new());

        let muster = Muster::builder()
            .config(memory_config())
            .host_name("node-a")
            .version("1.2.0")
            .registry(registry.clone())
            .lock(lock.clone())
            .version_store(store.clone())
            .build()
            .unwrap();
        let token = muster.shutdown_token();
        let mut identity_rx = muster.subscribe();

        let running = tokio::spawn(muster.run());

        let registered = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            identity_rx.wait_for(|id| id.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
        assert_eq!(registered.state, RegistrationState::Registered);
        assert_eq!(registered.instance.host_name, "node-a");
        assert_eq!(registry.instance_count(), 1);

        token.cancel();
        running.await.unwrap().unwrap();

        assert_eq!(registry.instance_count(), 0);
        assert_eq!(registry.count(RegistryCall::UnregisterInstance), 1);
        assert_eq!(lock.acquire_count(), 1);
        assert_eq!(lock.release_count(), 1);

        let raw = store
            .get(muster_core::config::SERVER_INFO_KEY)
            .await
            .unwrap()
            .unwrap();
        let info = ServerInfo::decode(&raw).unwrap();
        assert_eq!(info.version, "1.2.0");
        assert_eq!(info.upgraded_by.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_run_skips_upgrade_when_disabled() {
        let mut config = memory_config();
        config.upgrade.enabled = false;
        let store = Arc::new(MemoryVersionStore::new());
        let lock = Arc::new(MemoryLock::new());

        let token = CancellationToken::new();
        token.cancel();

        Muster::builder()
            .config(config)
            .host_name("node-a")
            .registry(Arc::new(MemoryRegistry::new()))
            .lock(lock.clone())
            .version_store(store.clone())
            .shutdown(token)
            .build()
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(lock.acquire_count(), 0);
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_registration_stops_run() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.fail_next(
            RegistryCall::Exist,
            muster_runtime::memory::RegistryFailure::Transport("connection refused".into()),
        );

        let result = Muster::builder()
            .config(memory_config())
            .host_name("node-a")
            .registry(registry.clone())
            .lock(Arc::new(MemoryLock::new()))
            .version_store(Arc::new(MemoryVersionStore::new()))
            .build()
            .unwrap()
            .run()
            .await;

        assert!(result.is_err());
        assert_eq!(registry.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_upgrade_only() {
        let store = Arc::new(MemoryVersionStore::new());
        store.insert(
            muster_core::config::SERVER_INFO_KEY,
            ServerInfo::new("1.2.0", "node-b").encode().unwrap(),
        );
        let fatal = Arc::new(AtomicUsize::new(0));
        let seen = fatal.clone();

        let muster = || {
            Muster::builder()
                .config(memory_config())
                .host_name("node-a")
                .version("1.2.0")
                .registry(Arc::new(MemoryRegistry::new()))
                .lock(Arc::new(MemoryLock::new()))
                .version_store(store.clone())
                .fatal_handler(Arc::new({
                    let seen = seen.clone();
                    move |_: &MusterError| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }))
                .build()
                .unwrap()
        };

        muster().upgrade(false).await.unwrap();
        assert_eq!(store.put_count(), 0);

        muster().upgrade(true).await.unwrap();
        assert_eq!(store.put_count(), 1);
        assert_eq!(fatal.load(Ordering::SeqCst), 0);
    }
}
