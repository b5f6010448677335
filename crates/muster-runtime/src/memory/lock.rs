use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use muster_core::cluster::{BoxFuture, DistributedLock, LockLease};
use muster_core::error::{MusterError, Result};

#[derive(Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    fail_acquire: Mutex<Option<String>>,
    fail_release: Mutex<Option<String>>,
}

/// Named locks that only exclude within one process.
#[derive(Default)]
pub struct MemoryLock {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    counters: Arc<Counters>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful acquisitions so far.
    pub fn acquire_count(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    /// Release calls so far, failed ones included.
    pub fn release_count(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Make the next acquire fail.
    pub fn fail_next_acquire(&self, message: impl Into<String>) {
        *take_lock(&self.counters.fail_acquire) = Some(message.into());
    }

    /// Make the next release report an error. The lock is still freed.
    pub fn fail_next_release(&self, message: impl Into<String>) {
        *take_lock(&self.counters.fail_release) = Some(message.into());
    }

    fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        take_lock(&self.locks)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

fn take_lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DistributedLock for MemoryLock {
    fn acquire<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Box<dyn LockLease>>> {
        Box::pin(async move {
            let injected = take_lock(&self.counters.fail_acquire).take();
            if let Some(message) = injected {
                return Err(MusterError::LockUnavailable(message));
            }

            let guard = self.slot(name).lock_owned().await;
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);

            Ok(Box::new(MemoryLease {
                name: name.to_string(),
                guard,
                counters: self.counters.clone(),
            }) as Box<dyn LockLease>)
        })
    }
}

struct MemoryLease {
    name: String,
    guard: OwnedMutexGuard<()>,
    counters: Arc<Counters>,
}

impl LockLease for MemoryLease {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let MemoryLease {
                name,
                guard,
                counters,
            } = *self;
            drop(guard);
            counters.released.fetch_add(1, Ordering::SeqCst);

            let injected = take_lock(&counters.fail_release).take();
            match injected {
                Some(message) => Err(MusterError::LockUnavailable(format!(
                    "release {}: {}",
                    name, message
                ))),
                None => Ok(()),
            }
        })
    }
}
