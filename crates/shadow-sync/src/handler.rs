//! Sync Handler facade (§4.9): the single entry point IPC handlers and the
//! MQTT Topic Manager push sync work through. Owns the active Strategy, the
//! Direction gate, and the configured sync set, following
//! `at_bridge::ipc::IpcHandler`'s shape of one struct holding shared state
//! behind an async-friendly lock and routing calls out to collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shadow_core::model::ShadowKey;
use shadow_queue::{RequestQueue, SyncRequest};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::direction::{Direction, DirectionGate};
use crate::mqtt::LocalRequestSink;
use crate::strategy::SyncStrategy;

pub struct SyncHandler {
    queue: Arc<RequestQueue>,
    strategy: RwLock<Arc<dyn SyncStrategy>>,
    ctx: SyncContext,
    direction: DirectionGate,
    sync_set: RwLock<Vec<ShadowKey>>,
}

impl SyncHandler {
    pub fn new(
        ctx: SyncContext,
        strategy: Arc<dyn SyncStrategy>,
        sync_set: Vec<ShadowKey>,
        direction: Direction,
    ) -> Self {
        let queue = strategy.queue();
        Self {
            queue,
            strategy: RwLock::new(strategy),
            ctx,
            direction: DirectionGate::new(direction),
            sync_set: RwLock::new(sync_set),
        }
    }

    /// The queue backing the current strategy, handed to a freshly
    /// constructed replacement strategy before calling [`Self::set_strategy`].
    pub fn queue(&self) -> Arc<RequestQueue> {
        self.queue.clone()
    }

    pub async fn start(&self) {
        self.strategy.read().await.start(self.ctx.clone()).await;
    }

    pub async fn stop(&self) {
        self.strategy.read().await.stop().await;
    }

    async fn enqueue(&self, request: SyncRequest) {
        if !self.direction.allows(&request) {
            debug!(
                kind = request.kind_name(),
                thing = request.thing_name(),
                "dropping sync request: direction gate closed"
            );
            return;
        }
        if let Err(err) = self.queue.put(request).await {
            warn!(%err, "failed to enqueue sync request, queue is stopping");
        }
    }

    pub async fn push_cloud_update_sync_request(
        &self,
        thing_name: &str,
        shadow_name: &str,
        payload: Value,
    ) {
        self.enqueue(SyncRequest::CloudUpdate {
            thing_name: thing_name.to_string(),
            shadow_name: shadow_name.to_string(),
            payload,
        })
        .await;
    }

    pub async fn push_cloud_delete_sync_request(&self, thing_name: &str, shadow_name: &str) {
        self.enqueue(SyncRequest::CloudDelete {
            thing_name: thing_name.to_string(),
            shadow_name: shadow_name.to_string(),
        })
        .await;
    }

    /// Enqueue a `FullSync` for every shadow currently under sync
    /// configuration. Used on startup and whenever the direction changes.
    pub async fn full_sync_on_startup(&self) {
        let keys = self.sync_set.read().await.clone();
        for key in keys {
            self.enqueue(SyncRequest::full_sync(key.thing_name, key.shadow_name))
                .await;
        }
    }

    /// Replace the configured synchronize set. Does not itself trigger a
    /// full sync — callers that add shadows dynamically should follow up
    /// with `full_sync_on_startup` if the new entries need an initial pass.
    pub async fn set_sync_set(&self, keys: Vec<ShadowKey>) {
        *self.sync_set.write().await = keys;
    }

    pub async fn set_direction(&self, new: Direction) {
        let previous = self.direction.set(new);
        if previous != new {
            info!(?previous, ?new, "sync direction changed");
            self.full_sync_on_startup().await;
        }
    }

    /// Stop the current strategy, start `new_strategy` (constructed by the
    /// caller against `self.queue()` so in-flight work is preserved), and
    /// make it the active one.
    pub async fn set_strategy(&self, new_strategy: Arc<dyn SyncStrategy>) {
        let old = {
            let mut guard = self.strategy.write().await;
            std::mem::replace(&mut *guard, new_strategy.clone())
        };
        old.stop().await;
        new_strategy.start(self.ctx.clone()).await;
        info!("sync strategy swapped");
    }
}

#[async_trait]
impl LocalRequestSink for SyncHandler {
    async fn push_local_update(&self, thing_name: &str, shadow_name: &str, payload: Value) {
        self.enqueue(SyncRequest::LocalUpdate {
            thing_name: thing_name.to_string(),
            shadow_name: shadow_name.to_string(),
            payload,
        })
        .await;
    }

    async fn push_local_delete(
        &self,
        thing_name: &str,
        shadow_name: &str,
        deleted_version_hint: Option<u64>,
    ) {
        self.enqueue(SyncRequest::LocalDelete {
            thing_name: thing_name.to_string(),
            shadow_name: shadow_name.to_string(),
            deleted_version_hint,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::stub::StubCloudClient;
    use shadow_core::config::SizeConfig;
    use shadow_core::sqlite_dao::SqliteShadowDao;
    use shadow_harness::rate_limiter::ShadowRateLimiters;

    /// A strategy double that only exposes the queue — start/stop never
    /// spawn real workers, so tests can drive the handler's push/direction
    /// logic without a live retry loop.
    struct NoopStrategy {
        queue: Arc<RequestQueue>,
    }

    #[async_trait]
    impl SyncStrategy for NoopStrategy {
        async fn start(&self, _ctx: SyncContext) {}
        async fn stop(&self) {}
        fn queue(&self) -> Arc<RequestQueue> {
            self.queue.clone()
        }
    }

    async fn test_handler(direction: Direction, sync_set: Vec<ShadowKey>) -> SyncHandler {
        let dao = Arc::new(SqliteShadowDao::open_in_memory().await.unwrap());
        let cloud = Arc::new(StubCloudClient::new());
        let rate_limiters = Arc::new(ShadowRateLimiters::new(
            &shadow_core::config::RateLimitsConfig::default(),
        ));
        let ctx = SyncContext::new(dao, cloud, SizeConfig::default(), rate_limiters);
        let queue = Arc::new(RequestQueue::default());
        let strategy: Arc<dyn SyncStrategy> = Arc::new(NoopStrategy { queue });
        SyncHandler::new(ctx, strategy, sync_set, direction)
    }

    #[tokio::test]
    async fn push_cloud_update_enqueues_under_default_direction() {
        let handler = test_handler(Direction::BetweenDeviceAndCloud, vec![]).await;
        handler
            .push_cloud_update_sync_request("robot-1", "", serde_json::json!({}))
            .await;
        assert_eq!(handler.queue.size().await, 1);
    }

    #[tokio::test]
    async fn cloud_to_device_direction_drops_cloud_pushes() {
        let handler = test_handler(Direction::CloudToDevice, vec![]).await;
        handler
            .push_cloud_update_sync_request("robot-1", "", serde_json::json!({}))
            .await;
        assert_eq!(handler.queue.size().await, 0);
    }

    #[tokio::test]
    async fn full_sync_on_startup_enqueues_every_configured_shadow() {
        let handler = test_handler(
            Direction::BetweenDeviceAndCloud,
            vec![ShadowKey::classic("a"), ShadowKey::classic("b")],
        )
        .await;
        handler.full_sync_on_startup().await;
        assert_eq!(handler.queue.size().await, 2);
    }

    #[tokio::test]
    async fn changing_direction_triggers_full_sync() {
        let handler = test_handler(
            Direction::BetweenDeviceAndCloud,
            vec![ShadowKey::classic("a")],
        )
        .await;
        handler.set_direction(Direction::DeviceToCloud).await;
        assert_eq!(handler.queue.size().await, 1);
    }

    #[tokio::test]
    async fn setting_same_direction_is_a_noop() {
        let handler = test_handler(
            Direction::BetweenDeviceAndCloud,
            vec![ShadowKey::classic("a")],
        )
        .await;
        handler.set_direction(Direction::BetweenDeviceAndCloud).await;
        assert_eq!(handler.queue.size().await, 0);
    }

    #[tokio::test]
    async fn set_strategy_transfers_queued_work() {
        let handler = test_handler(Direction::BetweenDeviceAndCloud, vec![]).await;
        handler
            .push_cloud_update_sync_request("robot-1", "", serde_json::json!({}))
            .await;

        let next_queue = handler.queue();
        let next: Arc<dyn SyncStrategy> = Arc::new(NoopStrategy { queue: next_queue });
        handler.set_strategy(next).await;

        assert_eq!(handler.queue.size().await, 1);
    }
}
