//! In-memory registry, lock and version store.
//!
//! Used as test doubles and for single-node development runs. Locks only
//! exclude within the current process.

mod lock;
mod registry;
mod store;

pub use lock::MemoryLock;
pub use registry::{MemoryRegistry, RegistryCall, RegistryFailure};
pub use store::MemoryVersionStore;
