mod heartbeat;
mod manager;
mod upgrade;

pub use heartbeat::HeartbeatHandle;
pub use manager::SelfRegistrationManager;
pub use upgrade::{exit_process, FatalHandler, UpgradeCoordinator};
