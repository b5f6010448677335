pub mod cluster;
pub mod db;
pub mod memory;
pub mod postgres;

pub use cluster::{HeartbeatHandle, SelfRegistrationManager, UpgradeCoordinator};
pub use db::Database;
