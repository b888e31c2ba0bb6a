//! Serialization of write access to storage-set disks.
//!
//! A storage set marked `mutex` allows only one ingest to write to its
//! disks at a time. Each slot of such a set gets its own async mutex,
//! created lazily on first acquisition and kept for the lifetime of the
//! process. Slots of non-mutex sets are never serialized and acquiring
//! them returns an empty guard.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::StorageSetConfig;

#[derive(Debug)]
pub struct DiskResources {
    /// Slots whose storage set requires serialized writes.
    mutex_slots: HashSet<String>,

    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the slot locks for the duration of one write.
///
/// Locks are released when the guard is dropped.
pub struct DiskLockGuard {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl DiskResources {
    pub fn new(storage_sets: &[StorageSetConfig]) -> Self {
        let mut mutex_slots = HashSet::new();
        for set in storage_sets {
            if !set.mutex {
                continue;
            }
            mutex_slots.insert(set.main_slot.clone());
            if let Some(replication) = &set.replication_slot {
                mutex_slots.insert(replication.clone());
            }
        }
        Self {
            mutex_slots,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    /// Acquires write access to a single slot.
    pub async fn acquire(&self, slot_id: &str) -> DiskLockGuard {
        let mut guards = Vec::with_capacity(1);
        if let Some(lock) = self.lock_for(slot_id) {
            tracing::debug!("Acquiring disk mutex for slot {}", slot_id);
            guards.push(lock.lock_owned().await);
        }
        DiskLockGuard { guards }
    }

    /// Acquires write access to a Main/Replication slot pair.
    ///
    /// The two locks are always taken in lexical slot order so that two
    /// ingests holding the pair in opposite roles cannot deadlock.
    pub async fn acquire_pair(&self, main_slot: &str, replication_slot: &str) -> DiskLockGuard {
        let mut slots = [main_slot, replication_slot];
        slots.sort_unstable();

        let mut guards = Vec::with_capacity(2);
        let mut previous = None;
        for slot_id in slots {
            if previous == Some(slot_id) {
                continue;
            }
            previous = Some(slot_id);
            if let Some(lock) = self.lock_for(slot_id) {
                tracing::debug!("Acquiring disk mutex for slot {}", slot_id);
                guards.push(lock.lock_owned().await);
            }
        }
        DiskLockGuard { guards }
    }

    fn lock_for(&self, slot_id: &str) -> Option<Arc<Mutex<()>>> {
        if !self.mutex_slots.contains(slot_id) {
            return None;
        }
        let mut locks = self.locks.lock().unwrap();
        Some(
            locks
                .entry(slot_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
        )
    }
}

impl DiskLockGuard {
    /// Number of slot locks held.
    pub fn held(&self) -> usize {
        self.guards.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn resources() -> DiskResources {
        DiskResources::new(&[
            StorageSetConfig {
                main_slot: "slot-a".to_string(),
                replication_slot: Some("slot-b".to_string()),
                mutex: true,
            },
            StorageSetConfig {
                main_slot: "slot-c".to_string(),
                replication_slot: None,
                mutex: false,
            },
        ])
    }

    #[tokio::test]
    async fn test_same_slot_excludes() {
        let resources = resources();

        let held = resources.acquire("slot-a").await;
        assert_eq!(held.held(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(20), resources.acquire("slot-a"));
        assert!(blocked.await.is_err());

        drop(held);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(100), resources.acquire("slot-a"))
                .await
                .unwrap();
        assert_eq!(reacquired.held(), 1);
    }

    #[tokio::test]
    async fn test_distinct_slots_are_independent() {
        let resources = resources();

        let _a = resources.acquire("slot-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), resources.acquire("slot-b"))
            .await
            .unwrap();
        assert_eq!(b.held(), 1);
    }

    #[tokio::test]
    async fn test_non_mutex_slot_never_blocks() {
        let resources = resources();

        let first = resources.acquire("slot-c").await;
        assert_eq!(first.held(), 0);
        let second = resources.acquire("slot-c").await;
        assert_eq!(second.held(), 0);
    }

    #[tokio::test]
    async fn test_pair_order_is_normalized() {
        let resources = resources();

        let forward = resources.acquire_pair("slot-a", "slot-b").await;
        assert_eq!(forward.held(), 2);
        drop(forward);

        // A reversed pair request must contend on the same locks rather
        // than interleave with a forward one.
        let reversed = resources.acquire_pair("slot-b", "slot-a").await;
        assert_eq!(reversed.held(), 2);

        let blocked =
            tokio::time::timeout(Duration::from_millis(20), resources.acquire("slot-b"));
        assert!(blocked.await.is_err());
    }

    #[tokio::test]
    async fn test_pair_with_same_slot_locks_once() {
        let resources = resources();

        let held = resources.acquire_pair("slot-a", "slot-a").await;
        assert_eq!(held.held(), 1);
    }
}
