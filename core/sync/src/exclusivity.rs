//! Per-key serialization.
//!
//! Operations sharing a key run one after the other in arrival order;
//! operations on different keys run concurrently. Contenders wait, they do
//! not fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::key::SyncKey;

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Table of per-key locks. Entries exist only while someone holds or waits
/// for the key.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: LockTable,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Waiters are served in FIFO order (tokio's mutex is fair).
    pub async fn acquire(&self, key: &SyncKey) -> KeyGuard {
        let name = key.as_key();
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(name.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        KeyGuard {
            name,
            table: self.table.clone(),
            lock,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited for.
    pub fn in_flight(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard {
    name: String,
    table: LockTable,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // Only the table and this guard reference the lock: nobody is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_same_key_is_sequential() {
        let locks = KeyedLocks::new();
        let key = SyncKey::Person(Uuid::new_v4());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let key = key.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire(&SyncKey::Person(Uuid::new_v4())).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&SyncKey::Person(Uuid::new_v4())),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.in_flight(), 2);
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let locks = KeyedLocks::new();
        let key = SyncKey::Object(Uuid::new_v4());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire(&key).await;
        let mut handles = Vec::new();
        for i in 0..4 {
            let locks = locks.clone();
            let key = key.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
                order.lock().unwrap().push(i);
            }));
            // Let the task enqueue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
