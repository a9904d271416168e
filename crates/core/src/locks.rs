//! Per-sandbox keyed mutexes.
//!
//! The single serialization point for one sandbox's lifecycle. Critical
//! sections must re-fetch their rows *after* acquiring the lock; data read
//! before acquisition reflects an older snapshot and must be discarded.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

pub struct SandboxLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SandboxLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Handle for this sandbox's mutex; concurrent calls for different ids
    /// never contend.
    pub fn get(&self, sandbox_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry after a sandbox is deleted, but only when no task
    /// still holds a handle. Entries that stay are just a few bytes.
    pub fn purge(&self, sandbox_id: &str) {
        self.locks
            .remove_if(sandbox_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for SandboxLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_serializes_critical_sections() {
        let locks = Arc::new(SandboxLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let lock = locks.get("sb_1");
                let _guard = lock.lock().await;
                order.lock().await.push("first-in");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                order.lock().await.push("first-out");
            })
        };
        // Give the first task a head start on the lock.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let second = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let lock = locks.get("sb_1");
                let _guard = lock.lock().await;
                order.lock().await.push("second-in");
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            *order.lock().await,
            vec!["first-in", "first-out", "second-in"]
        );
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = SandboxLocks::new();
        let a = locks.get("sb_a");
        let b = locks.get("sb_b");
        let _ga = a.lock().await;
        // Would deadlock if keys shared a mutex.
        let _gb = b.lock().await;
    }

    #[tokio::test]
    async fn purge_respects_live_handles() {
        let locks = SandboxLocks::new();
        let handle = locks.get("sb_1");
        locks.purge("sb_1");
        assert_eq!(locks.len(), 1);

        drop(handle);
        locks.purge("sb_1");
        assert!(locks.is_empty());
    }
}
