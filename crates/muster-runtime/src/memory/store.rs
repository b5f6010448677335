use std::collections::HashMap;
use std::sync::Mutex;

use muster_core::cluster::{BoxFuture, VersionStore};
use muster_core::error::{MusterError, Result};

#[derive(Default)]
struct State {
    values: HashMap<String, Vec<u8>>,
    puts: usize,
    fail_get: Option<String>,
    fail_put: Option<String>,
}

/// Process-local key/value store for the version record.
#[derive(Default)]
pub struct MemoryVersionStore {
    state: Mutex<State>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value directly, bypassing counters.
    pub fn insert(&self, key: impl Into<String>, value: Vec<u8>) {
        self.lock().values.insert(key.into(), value);
    }

    /// Writes made through [`VersionStore::put`], failed ones excluded.
    pub fn put_count(&self) -> usize {
        self.lock().puts
    }

    /// Make the next read fail.
    pub fn fail_next_get(&self, message: impl Into<String>) {
        self.lock().fail_get = Some(message.into());
    }

    /// Make the next write fail.
    pub fn fail_next_put(&self, message: impl Into<String>) {
        self.lock().fail_put = Some(message.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl VersionStore for MemoryVersionStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(message) = state.fail_get.take() {
                return Err(MusterError::Database(message));
            }
            Ok(state.values.get(key).cloned())
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(message) = state.fail_put.take() {
                return Err(MusterError::Database(message));
            }
            state.values.insert(key.to_string(), value);
            state.puts += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryVersionStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.put_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_put_is_not_counted() {
        let store = MemoryVersionStore::new();
        store.fail_next_put("disk full");

        assert!(store.put("k", b"v".to_vec()).await.is_err());
        assert_eq!(store.put_count(), 0);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
