//! MUSTER - cluster self-registration and version upgrade coordination
//!
//! A node registers its service and instance records in a shared registry,
//! keeps its lease alive with heartbeats, and takes part in a one-time
//! cluster version upgrade guarded by a global lock.

mod runtime;

#[doc(hidden)]
pub use muster_core;
#[doc(hidden)]
pub use muster_runtime;

pub use runtime::prelude;
pub use runtime::{Muster, MusterBuilder};
