//! Cluster version upgrade guarded by the global lock.
//!
//! Every node calls [`UpgradeCoordinator::upgrade_version`] on startup; the
//! lock plus a re-check under the lock make sure only the first node of a
//! rolling upgrade writes the new version record.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use muster_core::cluster::{compare_versions, DistributedLock, LockLease, ServerInfo, VersionStore};
use muster_core::config::{LockConfig, UpgradeConfig};
use muster_core::error::{MusterError, Result};

/// Called when the version record could not be written under the lock.
pub type FatalHandler = Arc<dyn Fn(&MusterError) + Send + Sync>;

/// Default fatal handler: the node must not keep serving a half-upgraded cluster.
pub fn exit_process() -> FatalHandler {
    Arc::new(|err: &MusterError| {
        error!("Upgrade server version failed, exiting: {}", err);
        std::process::exit(1);
    })
}

/// Performs the one-time version upgrade of the cluster.
pub struct UpgradeCoordinator {
    store: Arc<dyn VersionStore>,
    lock: Arc<dyn DistributedLock>,
    running_version: String,
    node_name: String,
    lock_name: String,
    record_key: String,
    acquire_timeout: Option<Duration>,
    shutdown: CancellationToken,
    on_fatal: FatalHandler,
}

impl UpgradeCoordinator {
    /// Create a coordinator for the running binary's version.
    pub fn new(
        store: Arc<dyn VersionStore>,
        lock: Arc<dyn DistributedLock>,
        running_version: impl Into<String>,
        lock_config: &LockConfig,
        upgrade_config: &UpgradeConfig,
    ) -> Self {
        Self {
            store,
            lock,
            running_version: running_version.into(),
            node_name: String::new(),
            lock_name: lock_config.name.clone(),
            record_key: upgrade_config.record_key.clone(),
            acquire_timeout: lock_config.acquire_timeout(),
            shutdown: CancellationToken::new(),
            on_fatal: exit_process(),
        }
    }

    /// Host name recorded as the writer of the version record.
    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }

    /// Abort lock acquisition when this token is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Replace the fatal handler.
    pub fn with_fatal_handler(mut self, on_fatal: FatalHandler) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    /// Version of the running binary.
    pub fn running_version(&self) -> &str {
        &self.running_version
    }

    /// Read the persisted version record.
    pub async fn server_info(&self) -> Result<Option<ServerInfo>> {
        match self.store.get(&self.record_key).await? {
            Some(bytes) => Ok(Some(ServerInfo::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether the persisted version is behind the running one.
    ///
    /// Read and decode failures answer `false`: without a readable record
    /// there is nothing safe to upgrade from.
    pub async fn needs_upgrade(&self) -> bool {
        let info = match self.server_info().await {
            Ok(info) => info,
            Err(e) => {
                error!(key = %self.record_key, "Check version failed, cannot load server info: {}", e);
                return false;
            }
        };

        let Some(info) = info else {
            debug!(key = %self.record_key, "No server version recorded yet");
            return true;
        };

        match compare_versions(&info.version, &self.running_version) {
            Ordering::Less => true,
            Ordering::Equal => false,
            Ordering::Greater => {
                warn!(
                    stored = %info.version,
                    running = %self.running_version,
                    "Running version is older than the cluster version"
                );
                false
            }
        }
    }

    /// Write the running version as the cluster version.
    pub async fn write_server_info(&self) -> Result<()> {
        let info = ServerInfo::new(&self.running_version, &self.node_name);
        let bytes = info.encode()?;
        self.store.put(&self.record_key, bytes).await
    }

    /// Upgrade the cluster version once, under the global lock.
    ///
    /// The return value only reports lock housekeeping: acquisition failure
    /// or release failure. A failed write is fatal and goes to the fatal
    /// handler after the lock has been released.
    pub async fn upgrade_version(&self) -> Result<()> {
        self.upgrade_inner(false).await
    }

    /// Rewrite the version record under the lock even if it is current.
    pub async fn force_upgrade(&self) -> Result<()> {
        self.upgrade_inner(true).await
    }

    async fn upgrade_inner(&self, force: bool) -> Result<()> {
        let lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                error!(lock = %self.lock_name, "Wait for server ready failed: {}", e);
                return Err(e);
            }
        };
        debug!(lock = %self.lock_name, "Global lock acquired");

        let mut fatal = None;
        if force || self.needs_upgrade().await {
            match self.write_server_info().await {
                Ok(()) => info!(version = %self.running_version, "Upgraded server version"),
                Err(e) => fatal = Some(e),
            }
        } else {
            debug!(version = %self.running_version, "Server version is current");
        }

        let released = lease.release().await;
        match &released {
            Ok(()) => debug!(lock = %self.lock_name, "Global lock released"),
            Err(e) => error!(lock = %self.lock_name, "Failed to release global lock: {}", e),
        }

        if let Some(e) = fatal {
            (self.on_fatal)(&e);
        }

        released
    }

    async fn acquire(&self) -> Result<Box<dyn LockLease>> {
        let acquire = self.lock.acquire(&self.lock_name);
        let bounded = async {
            match self.acquire_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, acquire).await {
                    Ok(result) => result,
                    Err(_) => Err(MusterError::LockUnavailable(format!(
                        "timed out after {:?} waiting for {}",
                        timeout, self.lock_name
                    ))),
                },
                None => acquire.await,
            }
        };

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => {
                Err(MusterError::Cancelled(format!("waiting for {}", self.lock_name)))
            }
            result = bounded => result,
        };

        result.map_err(|e| match e {
            MusterError::LockUnavailable(_) => e,
            other => MusterError::LockUnavailable(other.to_string()),
        })
    }
}
