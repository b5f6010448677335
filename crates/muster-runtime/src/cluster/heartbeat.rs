use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use muster_core::cluster::{ProcessIdentity, RegistrationState};
use muster_core::error::{MusterError, Result};

use super::manager::SelfRegistrationManager;

/// Handle to the background heartbeat loop.
///
/// Stopping the loop hands the manager back so shutdown can deregister
/// with the identity the loop last registered.
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<SelfRegistrationManager>,
    identity_rx: watch::Receiver<ProcessIdentity>,
}

impl HeartbeatHandle {
    /// Snapshot of the identity the loop is currently renewing.
    pub fn identity(&self) -> ProcessIdentity {
        self.identity_rx.borrow().clone()
    }

    /// Watch identity changes made by the loop.
    pub fn subscribe(&self) -> watch::Receiver<ProcessIdentity> {
        self.identity_rx.clone()
    }

    /// Check if the loop is running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and take the manager back.
    ///
    /// No final heartbeat is sent and nothing is deregistered.
    pub async fn stop(self) -> Result<SelfRegistrationManager> {
        self.stop.cancel();
        self.task
            .await
            .map_err(|e| MusterError::Internal(format!("Heartbeat task failed: {}", e)))
    }
}

/// Move the manager into a background task that renews its instance.
pub(crate) fn spawn(
    manager: SelfRegistrationManager,
    shutdown: CancellationToken,
) -> HeartbeatHandle {
    let stop = shutdown.child_token();
    let identity_rx = manager.subscribe();
    let task = tokio::spawn(run(manager, stop.clone()));

    HeartbeatHandle {
        stop,
        task,
        identity_rx,
    }
}

async fn run(mut manager: SelfRegistrationManager, stop: CancellationToken) -> SelfRegistrationManager {
    let interval = manager.heartbeat_interval();
    tracing::info!(interval = ?interval, "Heartbeat loop started");

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                tracing::info!("Heartbeat loop shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                if manager.heartbeat().await.is_ok() {
                    continue;
                }

                // The record is gone or unreachable: register from scratch.
                manager.set_state(RegistrationState::HeartbeatFailed);
                if let Err(e) = manager.register().await {
                    let service = &manager.identity().service;
                    tracing::error!(
                        environment = %service.environment,
                        app_id = %service.app_id,
                        service_name = %service.service_name,
                        version = %service.version,
                        "Retry to register failed: {}",
                        e
                    );
                }
            }
        }
    }

    manager
}
