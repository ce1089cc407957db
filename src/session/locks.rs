// Per-key async locks
// Serializes operations that share a key (session id, user id) without a global lock

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Map of lazily created async mutexes, pruned once nobody holds or awaits them
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` while holding the lock for `key`
    pub async fn run<T>(&self, key: &str, operation: impl Future<Output = T>) -> T {
        let lock = self.acquire(key);
        let result = {
            let _guard = lock.lock().await;
            operation.await
        };
        drop(lock);
        self.prune(key);
        result
    }

    /// Keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn acquire(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    fn prune(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}
