use super::registry::BoxFuture;
use crate::error::Result;

/// Cluster-wide named mutual exclusion.
///
/// `acquire` blocks (retrying internally) until the lock is held or the
/// backend fails. Callers bound the wait with their own timeout.
pub trait DistributedLock: Send + Sync + 'static {
    /// Acquire the named lock.
    fn acquire<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Box<dyn LockLease>>>;
}

/// A held lock. Consumed by `release`, so a lease is released at most once.
pub trait LockLease: Send {
    /// Name of the held lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}
