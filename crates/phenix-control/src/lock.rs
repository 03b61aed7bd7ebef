//! Per-resource mutual exclusion for lifecycle operations
//!
//! The lock table maps a [`LockKey`] to the status of the mutation currently
//! holding it. Acquisition never blocks or queues: a second caller for the
//! same key fails immediately with [`ControlError::Locked`].

use crate::error::{ControlError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use phenix_types::{LockKey, LockStatus};
use std::sync::Arc;
use tracing::{debug, warn};

/// Process-wide table of in-flight mutations
#[derive(Debug, Default)]
pub struct LockTable {
    entries: DashMap<LockKey, LockStatus>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` for `key` if nothing holds it.
    ///
    /// The caller must [`unlock`](Self::unlock) on every exit path. Prefer
    /// [`acquire`](Self::acquire), which releases on drop.
    pub fn try_lock(&self, key: LockKey, status: LockStatus) -> Result<()> {
        match self.entries.entry(key) {
            Entry::Occupied(held) => {
                let err = ControlError::Locked {
                    key: held.key().clone(),
                    status: *held.get(),
                };
                warn!(key = %held.key(), held = %held.get(), wanted = %status, "Lock conflict");
                Err(err)
            }
            Entry::Vacant(slot) => {
                debug!(key = %slot.key(), status = %status, "Lock acquired");
                slot.insert(status);
                Ok(())
            }
        }
    }

    /// Acquire a lock released when the returned guard is dropped
    pub fn acquire(self: &Arc<Self>, key: LockKey, status: LockStatus) -> Result<LockGuard> {
        self.try_lock(key.clone(), status)?;

        Ok(LockGuard {
            table: Arc::clone(self),
            key,
            status,
        })
    }

    /// Release `key`. Releasing an unheld key is a no-op.
    pub fn unlock(&self, key: &LockKey) {
        if let Some((key, status)) = self.entries.remove(key) {
            debug!(key = %key, status = %status, "Lock released");
        }
    }

    /// Status of the mutation holding `key`, if any
    pub fn status_of(&self, key: &LockKey) -> Option<LockStatus> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of held locks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every held lock, sorted by key
    pub fn snapshot(&self) -> Vec<(LockKey, LockStatus)> {
        let mut held: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }
}

/// Scoped lock, released on drop
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<LockTable>,
    key: LockKey,
    status: LockStatus,
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn status(&self) -> LockStatus {
        self.status
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.unlock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lock_conflicts() {
        let table = LockTable::new();
        let key = LockKey::experiment("expA");

        table.try_lock(key.clone(), LockStatus::Starting).unwrap();

        let err = table.try_lock(key.clone(), LockStatus::Stopping).unwrap_err();
        match err {
            ControlError::Locked { key: k, status } => {
                assert_eq!(k, key);
                assert_eq!(status, LockStatus::Starting);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        table.unlock(&key);
        table.try_lock(key.clone(), LockStatus::Stopping).unwrap();
        assert_eq!(table.status_of(&key), Some(LockStatus::Stopping));
    }

    #[test]
    fn test_unlock_unheld_is_noop() {
        let table = LockTable::new();
        table.unlock(&LockKey::experiment("nothing"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_distinct_keys_do_not_interfere() {
        let table = LockTable::new();
        table
            .try_lock(LockKey::experiment("exp1"), LockStatus::Starting)
            .unwrap();
        table
            .try_lock(LockKey::vm("exp1", "host-01"), LockStatus::Redeploying)
            .unwrap();
        table
            .try_lock(LockKey::experiment("exp2"), LockStatus::Starting)
            .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.status_of(&LockKey::vm("exp1", "host-01")),
            Some(LockStatus::Redeploying)
        );
        assert_eq!(table.status_of(&LockKey::vm("exp1", "host-02")), None);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let table = Arc::new(LockTable::new());
        let key = LockKey::experiment("exp1");

        {
            let guard = table.acquire(key.clone(), LockStatus::Creating).unwrap();
            assert_eq!(guard.status(), LockStatus::Creating);
            assert!(table.is_locked(&key));
            assert!(table.acquire(key.clone(), LockStatus::Deleting).is_err());
        }

        assert!(!table.is_locked(&key));
        assert!(table.acquire(key, LockStatus::Deleting).is_ok());
    }

    #[test]
    fn test_snapshot_sorted() {
        let table = LockTable::new();
        table.try_lock(LockKey::experiment("b"), LockStatus::Stopping).unwrap();
        table.try_lock(LockKey::experiment("a"), LockStatus::Starting).unwrap();

        let held = table.snapshot();
        assert_eq!(held[0].0.as_str(), "a");
        assert_eq!(held[1].1, LockStatus::Stopping);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_lock_exactly_one_wins() {
        for _ in 0..50 {
            let table = Arc::new(LockTable::new());
            let barrier = Arc::new(tokio::sync::Barrier::new(8));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        table
                            .try_lock(LockKey::experiment("exp1"), LockStatus::Starting)
                            .is_ok()
                    })
                })
                .collect();

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }

            assert_eq!(winners, 1);
        }
    }
}
