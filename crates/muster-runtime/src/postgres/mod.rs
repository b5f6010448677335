//! PostgreSQL-backed registry, global lock and version store.

mod lock;
mod registry;
mod schema;
mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use lock::{lock_id, PgAdvisoryLock};
pub use registry::PgRegistry;
pub use schema::ensure_schema;
pub use store::PgVersionStore;
