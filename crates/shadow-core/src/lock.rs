//! Per-shadow-key async lock table.
//!
//! Every operation that touches a single shadow's document or sync metadata
//! must hold the lock for that `ShadowKey` for its whole duration, so a
//! cloud-driven update and a local-driven update on the same shadow never
//! interleave. Locks are created lazily and dropped once their reference
//! count returns to zero, so the table does not grow without bound across a
//! daemon's lifetime.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ShadowKey;

struct Entry {
    lock: Arc<Mutex<()>>,
    refcount: usize,
}

#[derive(Default)]
pub struct ShadowLockTable {
    entries: DashMap<ShadowKey, Entry>,
}

/// RAII guard: releases the per-key mutex and, if it was the last holder,
/// removes the table entry on drop.
pub struct ShadowLockGuard<'a> {
    table: &'a ShadowLockTable,
    key: ShadowKey,
    _guard: OwnedMutexGuard<()>,
}

impl ShadowLockTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Acquire the lock for `key`, blocking (asynchronously) until available.
    pub async fn lock(&self, key: &ShadowKey) -> ShadowLockGuard<'_> {
        let arc = {
            let mut entry = self.entries.entry(key.clone()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            entry.lock.clone()
        };

        let guard = arc.lock_owned().await;
        ShadowLockGuard {
            table: self,
            key: key.clone(),
            _guard: guard,
        }
    }

    fn release(&self, key: &ShadowKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                drop(entry);
                self.entries.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for ShadowLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test]
    async fn disjoint_keys_do_not_block_each_other() {
        let table = StdArc::new(ShadowLockTable::new());
        let a = ShadowKey::classic("a");
        let b = ShadowKey::classic("b");

        let _guard_a = table.lock(&a).await;
        let t = table.clone();
        let handle = tokio::spawn(async move {
            let _guard_b = t.lock(&b).await;
        });
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("lock on disjoint key should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn same_key_serializes_and_cleans_up() {
        let table = ShadowLockTable::new();
        let key = ShadowKey::classic("a");

        {
            let _g = table.lock(&key).await;
            assert_eq!(table.len(), 1);
        }
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn contended_key_blocks_second_acquirer() {
        let table = StdArc::new(ShadowLockTable::new());
        let key = ShadowKey::classic("a");

        let guard = table.lock(&key).await;
        let t = table.clone();
        let k = key.clone();
        let handle = tokio::spawn(async move {
            let _g = t.lock(&k).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("second acquirer should unblock once first guard drops")
            .unwrap();
    }
}
