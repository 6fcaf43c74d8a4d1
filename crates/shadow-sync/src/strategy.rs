//! Sync Strategy (§4.5): two scheduling policies behind one interface,
//! following `at-daemon/src/daemon.rs`'s `tokio::select!`-driven interval
//! loop for the periodic variant and a plain worker-pool spawn for the
//! real-time variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shadow_harness::retry::{BackoffPolicy, RetryError, Retryer};
use shadow_harness::shutdown::ShutdownSignal;
use shadow_queue::{QueueError, RequestQueue, SyncRequest};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::error::{classify, SyncError};
use crate::requests::{execute, is_update_necessary};

const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// One complete attempt at a request: the `isUpdateNecessary` precondition
/// folded into the retried operation, since both read through the same DAO
/// snapshot and a stale payload should not be retried once the underlying
/// state has already converged.
async fn attempt(ctx: &SyncContext, request: SyncRequest) -> Result<(), SyncError> {
    if !is_update_necessary(ctx, &request).await? {
        return Ok(());
    }
    execute(ctx, request).await
}

/// The two sync-delivery policies share this surface. `put_sync_request`,
/// `clear_sync_queue`, and `remaining_capacity` are plain passthroughs to the
/// shared queue, so a strategy swap can hand the same `Arc<RequestQueue>` to
/// the next strategy without losing anything in flight.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    async fn start(&self, ctx: SyncContext);
    async fn stop(&self);
    fn queue(&self) -> Arc<RequestQueue>;

    async fn put_sync_request(&self, request: SyncRequest) -> Result<(), QueueError> {
        self.queue().put(request).await
    }

    async fn clear_sync_queue(&self) {
        self.queue().clear().await
    }

    async fn remaining_capacity(&self) -> usize {
        self.queue().remaining_capacity().await
    }
}

async fn take_or_shutdown(
    queue: &RequestQueue,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Option<SyncRequest> {
    tokio::select! {
        result = queue.take() => result.ok(),
        _ = shutdown_rx.recv() => None,
    }
}

async fn offer_and_take_or_shutdown(
    queue: &RequestQueue,
    request: SyncRequest,
    is_new: bool,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Option<SyncRequest> {
    tokio::select! {
        result = queue.offer_and_take(request, is_new) => result.ok(),
        _ = shutdown_rx.recv() => None,
    }
}

/// The common `syncLoop` (§4.5): run the Retryer against the head of the
/// queue, and on a non-terminal outcome push a replacement back in and keep
/// going without ever leaving the loop body.
async fn worker_loop(ctx: SyncContext, queue: Arc<RequestQueue>, shutdown: ShutdownSignal) {
    let mut shutdown_rx = shutdown.subscribe();

    let Some(mut current) = take_or_shutdown(&queue, &mut shutdown_rx).await else {
        return;
    };
    let mut policy_is_default = true;

    loop {
        if shutdown.is_shutting_down() {
            return;
        }

        let policy = if policy_is_default {
            BackoffPolicy::default_policy()
        } else {
            BackoffPolicy::fallback_policy()
        };
        let retryer = Retryer::new(policy).with_clock(ctx.clock.clone());
        let request = current.clone();
        let ctx_ref = &ctx;
        let shutdown_ref = &shutdown;

        let result = retryer
            .run(
                |e: &SyncError| classify(e),
                || shutdown_ref.is_shutting_down(),
                || {
                    let request = request.clone();
                    async move { attempt(ctx_ref, request).await }
                },
            )
            .await;

        current = match result {
            Ok(()) => {
                policy_is_default = true;
                match take_or_shutdown(&queue, &mut shutdown_rx).await {
                    Some(next) => next,
                    None => return,
                }
            }
            Err(RetryError::Skipped { source }) => {
                debug!(%source, kind = current.kind_name(), "sync request skipped");
                policy_is_default = true;
                match take_or_shutdown(&queue, &mut shutdown_rx).await {
                    Some(next) => next,
                    None => return,
                }
            }
            Err(RetryError::Conflict { .. }) | Err(RetryError::UnknownShadow { .. }) => {
                let full = SyncRequest::full_sync(current.thing_name(), current.shadow_name());
                match offer_and_take_or_shutdown(&queue, full, true, &mut shutdown_rx).await {
                    Some(next) => {
                        policy_is_default = true;
                        next
                    }
                    None => return,
                }
            }
            Err(RetryError::Exhausted { source, .. }) => {
                warn!(%source, kind = current.kind_name(), "retry policy exhausted, requeuing");
                let requeued = current.clone();
                match offer_and_take_or_shutdown(&queue, requeued, false, &mut shutdown_rx).await {
                    Some(next) => {
                        policy_is_default = next != current;
                        next
                    }
                    None => return,
                }
            }
            Err(RetryError::Interrupted) => return,
        };
    }
}

/// Dedicated worker threads each blocking on `take()`. Default parallelism
/// is 1; configurable at construction.
pub struct RealTimeSyncStrategy {
    queue: Arc<RequestQueue>,
    parallelism: usize,
    shutdown: ShutdownSignal,
    workers: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl RealTimeSyncStrategy {
    pub fn new(queue: Arc<RequestQueue>, parallelism: usize) -> Self {
        Self {
            queue,
            parallelism: parallelism.max(1),
            shutdown: ShutdownSignal::new(),
            workers: AsyncMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SyncStrategy for RealTimeSyncStrategy {
    async fn start(&self, ctx: SyncContext) {
        let mut workers = self.workers.lock().await;
        for _ in 0..self.parallelism {
            let ctx = ctx.clone();
            let queue = self.queue.clone();
            let shutdown = self.shutdown.clone();
            workers.push(tokio::spawn(worker_loop(ctx, queue, shutdown)));
        }
        info!(parallelism = self.parallelism, "real-time sync strategy started");
    }

    async fn stop(&self) {
        self.shutdown.trigger();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().await);
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(WORKER_STOP_TIMEOUT, join_all).await.is_err() {
            warn!("real-time sync strategy workers did not exit within the stop timeout");
        } else {
            info!("real-time sync strategy stopped");
        }
    }

    fn queue(&self) -> Arc<RequestQueue> {
        self.queue.clone()
    }
}

/// A single scheduled task that drains the queue with `poll()` every
/// `delay`. Each item gets exactly one attempt per firing; a failure is
/// re-enqueued for the next tick rather than retried in-loop, so the tick
/// interval itself supplies the backoff instead of an in-task sleep that
/// would otherwise stall every other configured shadow until it elapsed.
pub struct PeriodicSyncStrategy {
    queue: Arc<RequestQueue>,
    delay: Duration,
    shutdown: ShutdownSignal,
    running: Arc<AtomicBool>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl PeriodicSyncStrategy {
    pub fn new(queue: Arc<RequestQueue>, delay: Duration) -> Self {
        Self {
            queue,
            delay,
            shutdown: ShutdownSignal::new(),
            running: Arc::new(AtomicBool::new(false)),
            task: AsyncMutex::new(None),
        }
    }
}

async fn drain_once(ctx: &SyncContext, queue: &RequestQueue) {
    while let Some(request) = queue.poll().await {
        let kind = request.kind_name();
        match attempt(ctx, request.clone()).await {
            Ok(()) => {}
            Err(err) => match classify(&err) {
                shadow_harness::retry::ErrorClass::Retryable => {
                    warn!(%err, kind, "periodic attempt failed, retrying next tick");
                    let _ = queue.put(request).await;
                }
                shadow_harness::retry::ErrorClass::Conflict
                | shadow_harness::retry::ErrorClass::UnknownShadow => {
                    debug!(%err, kind, "escalating to full sync next tick");
                    let full = SyncRequest::full_sync(request.thing_name(), request.shadow_name());
                    let _ = queue.put(full).await;
                }
                shadow_harness::retry::ErrorClass::Skip => {
                    debug!(%err, kind, "periodic attempt skipped");
                }
                shadow_harness::retry::ErrorClass::Interrupted => return,
            },
        }
    }
}

#[async_trait]
impl SyncStrategy for PeriodicSyncStrategy {
    async fn start(&self, ctx: SyncContext) {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();
        let running = self.running.clone();
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let mut ticker = tokio::time::interval(delay);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if running
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                            .is_err()
                        {
                            debug!("periodic sync firing skipped, previous firing still running");
                            continue;
                        }
                        drain_once(&ctx, &queue).await;
                        running.store(false, Ordering::SeqCst);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        *self.task.lock().await = Some(handle);
        info!(delay_secs = self.delay.as_secs(), "periodic sync strategy started");
    }

    async fn stop(&self) {
        self.shutdown.trigger();
        if let Some(handle) = self.task.lock().await.take() {
            if tokio::time::timeout(WORKER_STOP_TIMEOUT, handle).await.is_err() {
                warn!("periodic sync strategy task did not exit within the stop timeout");
            } else {
                info!("periodic sync strategy stopped");
            }
        }
    }

    fn queue(&self) -> Arc<RequestQueue> {
        self.queue.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::stub::StubCloudClient;
    use serde_json::json;
    use shadow_core::config::SizeConfig;
    use shadow_core::sqlite_dao::SqliteShadowDao;
    use shadow_harness::rate_limiter::ShadowRateLimiters;

    async fn test_context() -> SyncContext {
        let dao = Arc::new(SqliteShadowDao::open_in_memory().await.unwrap());
        let cloud = Arc::new(StubCloudClient::new());
        let rate_limiters = Arc::new(ShadowRateLimiters::new(
            &shadow_core::config::RateLimitsConfig::default(),
        ));
        SyncContext::new(dao, cloud, SizeConfig::default(), rate_limiters)
    }

    #[tokio::test]
    async fn real_time_strategy_drains_a_put_request() {
        let ctx = test_context().await;
        ctx.dao
            .update_shadow_thing(&shadow_core::model::ShadowKey::classic("robot-1"), &json!({"reported": {"a": 1}}), 1)
            .await
            .unwrap();

        let queue = Arc::new(RequestQueue::default());
        let strategy = RealTimeSyncStrategy::new(queue.clone(), 1);
        strategy.start(ctx.clone()).await;

        strategy
            .put_sync_request(SyncRequest::full_sync("robot-1", ""))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.size().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        strategy.stop().await;

        let info = ctx
            .dao
            .get_shadow_sync_information(&shadow_core::model::ShadowKey::classic("robot-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.cloud_version, 1);
    }

    #[tokio::test]
    async fn periodic_strategy_drains_queue_on_tick() {
        let ctx = test_context().await;
        ctx.dao
            .update_shadow_thing(&shadow_core::model::ShadowKey::classic("robot-1"), &json!({"reported": {"a": 1}}), 1)
            .await
            .unwrap();

        let queue = Arc::new(RequestQueue::default());
        let strategy = PeriodicSyncStrategy::new(queue.clone(), Duration::from_millis(20));
        strategy.start(ctx.clone()).await;

        strategy
            .put_sync_request(SyncRequest::full_sync("robot-1", ""))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while queue.size().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        strategy.stop().await;

        let info = ctx
            .dao
            .get_shadow_sync_information(&shadow_core::model::ShadowKey::classic("robot-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.cloud_version, 1);
    }
}
