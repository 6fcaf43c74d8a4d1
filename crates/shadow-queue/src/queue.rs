//! A deduplicating, blocking queue: at most one entry per `ShadowKey`, FIFO
//! by first-arrival order of each key, with arrivals for an already-queued
//! key coalesced in place via [`crate::merger::merge`].

use std::collections::{HashMap, VecDeque};

use shadow_core::model::ShadowKey;
use tokio::sync::{Mutex, Notify};

use crate::merger::merge;
use crate::request::SyncRequest;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is stopping")]
    Cancelled,
}

struct Inner {
    order: VecDeque<ShadowKey>,
    entries: HashMap<ShadowKey, SyncRequest>,
    capacity: usize,
    stopped: bool,
}

/// A deduplicating blocking queue shared by IPC handlers, the MQTT manager,
/// and the sync strategy's workers.
pub struct RequestQueue {
    inner: Mutex<Inner>,
    not_full: Notify,
    not_empty: Notify,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                capacity,
                stopped: false,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    /// Insert or coalesce `request`, blocking while the queue is at
    /// capacity and the key is not already present (a coalescing put never
    /// needs to wait on capacity).
    pub async fn put(&self, request: SyncRequest) -> Result<(), QueueError> {
        loop {
            // Registered while still holding the lock, so a `stop()` (or a
            // `take()`/`remove()` opening up capacity) that runs between
            // this loop iteration's capacity check and the `.await` below
            // can never be missed: `Notify` guarantees a `notified()` future
            // created before a `notify_*` call observes that call, even if
            // it isn't polled until afterwards.
            let notified;
            {
                let mut guard = self.inner.lock().await;
                if guard.stopped {
                    return Err(QueueError::Cancelled);
                }

                let key = request.key();
                if let Some(existing) = guard.entries.remove(&key) {
                    guard.entries.insert(key, merge(existing, request));
                    self.not_empty.notify_one();
                    return Ok(());
                }

                if guard.entries.len() < guard.capacity {
                    guard.order.push_back(key.clone());
                    guard.entries.insert(key, request);
                    self.not_empty.notify_one();
                    return Ok(());
                }

                notified = self.not_full.notified();
            }
            notified.await;
        }
    }

    /// Atomically place `request` back into the queue (as `offerAndTake`
    /// does for a retrying worker) and take the next entry. If nothing else
    /// is queued for `request`'s key, it becomes the head again immediately
    /// — signalling "retry me" without disturbing FIFO order for other keys.
    ///
    /// `is_new` says which side of a collision is the more recent one:
    /// `true` for a freshly built escalation (e.g. the `FullSync` pushed
    /// after a conflict) that should overlay whatever is already queued;
    /// `false` for a stale request a worker is handing back after a failed
    /// attempt, which should itself be overlaid by anything that arrived
    /// for the same key while it was in flight. Either way, an entry
    /// already queued for this key is merged, never silently dropped.
    pub async fn offer_and_take(
        &self,
        request: SyncRequest,
        is_new: bool,
    ) -> Result<SyncRequest, QueueError> {
        {
            let mut guard = self.inner.lock().await;
            if guard.stopped {
                return Err(QueueError::Cancelled);
            }
            let key = request.key();
            if !guard.entries.contains_key(&key) {
                guard.order.push_back(key.clone());
            }
            let slot = guard.entries.remove(&key);
            let merged = match slot {
                Some(existing) if is_new => merge(existing, request),
                Some(existing) => merge(request, existing),
                None => request,
            };
            guard.entries.insert(key, merged);
            self.not_empty.notify_one();
        }
        self.take().await
    }

    /// Block until an entry is available, then remove and return it in FIFO
    /// order.
    pub async fn take(&self) -> Result<SyncRequest, QueueError> {
        loop {
            // Same registered-before-unlocking pattern as `put()`, so a
            // `stop()` racing with an empty-queue wait can't be missed.
            let notified;
            {
                let mut guard = self.inner.lock().await;
                while let Some(key) = guard.order.front().cloned() {
                    if let Some(request) = guard.entries.remove(&key) {
                        guard.order.pop_front();
                        self.not_full.notify_one();
                        return Ok(request);
                    }
                    guard.order.pop_front();
                }
                if guard.stopped {
                    return Err(QueueError::Cancelled);
                }
                notified = self.not_empty.notified();
            }
            notified.await;
        }
    }

    /// Non-blocking `take`: returns `None` if the queue is currently empty.
    pub async fn poll(&self) -> Option<SyncRequest> {
        let mut guard = self.inner.lock().await;
        while let Some(key) = guard.order.front().cloned() {
            guard.order.pop_front();
            if let Some(request) = guard.entries.remove(&key) {
                self.not_full.notify_one();
                return Some(request);
            }
        }
        None
    }

    pub async fn remove(&self, key: &ShadowKey) -> Option<SyncRequest> {
        let mut guard = self.inner.lock().await;
        let removed = guard.entries.remove(key);
        if removed.is_some() {
            self.not_full.notify_one();
        }
        removed
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.order.clear();
        guard.entries.clear();
        self.not_full.notify_waiters();
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn remaining_capacity(&self) -> usize {
        let guard = self.inner.lock().await;
        guard.capacity.saturating_sub(guard.entries.len())
    }

    /// Mark the queue as stopping: blocked `put`s and `take`s return
    /// `Cancelled`, and no further entries are accepted.
    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        guard.stopped = true;
        drop(guard);
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
