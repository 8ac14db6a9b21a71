//! Key-scoped mutual exclusion.
//!
//! One async mutex per key, created on demand and dropped once nobody holds
//! or waits for it. Holders of different keys never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map of per-key async locks
#[derive(Debug, Default)]
pub struct KeyLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a key is locked
#[derive(Debug)]
pub struct KeyGuard<'a> {
    owner: &'a KeyLock,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLock {
    /// Empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `key` is free and take it
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = Arc::clone(self.table().entry(key.to_string()).or_default());
        let guard = mutex.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// No key held or awaited
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.owner.table();
        // Only the table still references the mutex: no holder, no waiter
        if table.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            table.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyLock::new();
        let _a = locks.lock("svc-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("svc-b")).await;
        assert!(b.is_ok(), "svc-b must not wait for svc-a");
    }

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLock::new());
        let first = locks.lock("svc-a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _second = locks.lock("svc-a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "second holder must wait");

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_entries_are_released() {
        let locks = KeyLock::new();
        {
            let _a = locks.lock("svc-a").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }
}
