//! Literal end-to-end scenarios, driving the real `SyncContext` + `SyncHandler`
//! + `RealTimeSyncStrategy` stack against an in-memory DAO and the stub cloud
//! client rather than any single module in isolation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use shadow_core::config::{RateLimitsConfig, SizeConfig};
use shadow_core::model::{ShadowKey, SyncInformation};
use shadow_core::sqlite_dao::SqliteShadowDao;
use shadow_core::ShadowDao;
use shadow_harness::rate_limiter::ShadowRateLimiters;
use shadow_queue::RequestQueue;
use shadow_sync::cloud::stub::StubCloudClient;
use shadow_sync::context::SyncContext;
use shadow_sync::direction::Direction;
use shadow_sync::strategy::{RealTimeSyncStrategy, SyncStrategy};
use shadow_sync::SyncHandler;

async fn test_context() -> (SyncContext, Arc<StubCloudClient>) {
    let dao: Arc<dyn ShadowDao> = Arc::new(SqliteShadowDao::open_in_memory().await.unwrap());
    let cloud = Arc::new(StubCloudClient::new());
    let rate_limiters = Arc::new(ShadowRateLimiters::new(&RateLimitsConfig::default()));
    let ctx = SyncContext::new(dao, cloud.clone(), SizeConfig::default(), rate_limiters);
    (ctx, cloud)
}

async fn drain(queue: &RequestQueue) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.size().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue did not drain in time");
}

/// Scenario 1: startup full sync pulls from cloud when local is empty, and
/// never writes back to the cloud it just read from.
#[tokio::test]
async fn startup_full_sync_pulls_from_cloud_without_writing_back() {
    let (ctx, cloud) = test_context().await;
    cloud
        .seed(
            "robot-1",
            "",
            json!({"state": {"desired": {"SomeKey": "foo"}}, "version": 10}),
        )
        .await;

    let queue = Arc::new(RequestQueue::default());
    let strategy: Arc<dyn SyncStrategy> = Arc::new(RealTimeSyncStrategy::new(queue.clone(), 1));
    let sync = Arc::new(SyncHandler::new(
        ctx.clone(),
        strategy,
        vec![ShadowKey::classic("robot-1")],
        Direction::BetweenDeviceAndCloud,
    ));
    sync.start().await;
    sync.full_sync_on_startup().await;
    drain(&queue).await;
    sync.stop().await;

    let key = ShadowKey::classic("robot-1");
    let local = ctx.dao.get_shadow_thing(&key).await.unwrap().unwrap();
    assert_eq!(local["desired"]["SomeKey"], json!("foo"));
    assert_eq!(local["version"], json!(1));

    let info = ctx.dao.get_shadow_sync_information(&key).await.unwrap().unwrap();
    assert_eq!(info.local_version, 1);
    assert_eq!(info.cloud_version, 10);

    // The cloud document is untouched: still at version 10, not bumped.
    let cloud_doc = cloud.get("robot-1", "").await.unwrap();
    assert_eq!(cloud_doc["version"], json!(10));
}

/// Scenario 2: a local update on a shadow the cloud has never seen propagates
/// with `version=0` and leaves sync info at `localVersion=1, cloudVersion=1`.
#[tokio::test]
async fn local_update_on_unknown_cloud_shadow_propagates_once() {
    let (ctx, cloud) = test_context().await;
    let key = ShadowKey::classic("robot-1");

    let queue = Arc::new(RequestQueue::default());
    let strategy: Arc<dyn SyncStrategy> = Arc::new(RealTimeSyncStrategy::new(queue.clone(), 1));
    let sync = Arc::new(SyncHandler::new(
        ctx.clone(),
        strategy,
        vec![],
        Direction::BetweenDeviceAndCloud,
    ));
    sync.start().await;

    // What `ShadowIpcHandler::handle_update` does: write the overlay locally
    // under optimistic concurrency, then enqueue the same overlay as a
    // `CloudUpdate`.
    let overlay = json!({"desired": {"SomeKey": "foo"}});
    ctx.dao.update_shadow_thing(&key, &overlay, 1).await.unwrap();
    sync.push_cloud_update_sync_request("robot-1", "", overlay).await;

    drain(&queue).await;
    sync.stop().await;

    let doc = cloud.get("robot-1", "").await.unwrap();
    assert_eq!(doc["version"], json!(0));
    assert_eq!(doc["state"]["desired"]["SomeKey"], json!("foo"));

    let info = ctx.dao.get_shadow_sync_information(&key).await.unwrap().unwrap();
    assert_eq!(info.local_version, 1);
    assert_eq!(info.cloud_version, 1);
}

/// Scenario 3: two cloud-update requests for the same shadow arriving before
/// the worker gets to either of them coalesce into a single queued entry;
/// a transient cloud failure on the first attempt is retried and the request
/// that finally lands carries both updates' content in one call.
#[tokio::test(start_paused = true)]
async fn two_cloud_updates_for_the_same_shadow_coalesce_and_survive_one_retry() {
    let (ctx, cloud) = test_context().await;
    let key = ShadowKey::classic("robot-1");

    ctx.dao.update_shadow_thing(&key, &json!({"reported": {}}), 1).await.unwrap();
    let mut info = SyncInformation::new(&key, 0);
    info.local_version = 1;
    info.cloud_version = 10;
    ctx.dao.insert_sync_info_if_not_exists(&info).await.unwrap();

    let queue = Arc::new(RequestQueue::default());
    let strategy: Arc<dyn SyncStrategy> = Arc::new(RealTimeSyncStrategy::new(queue.clone(), 1));
    let sync = Arc::new(SyncHandler::new(
        ctx.clone(),
        strategy,
        vec![],
        Direction::BetweenDeviceAndCloud,
    ));

    // Both updates land locally and get queued before any worker is running,
    // so the second `put` coalesces with the first rather than racing a
    // worker that already took it off the queue.
    ctx.dao
        .update_shadow_thing(&key, &json!({"reported": {"SomeKey": "foo", "OtherKey": 1}}), 2)
        .await
        .unwrap();
    sync.push_cloud_update_sync_request(
        "robot-1",
        "",
        json!({"reported": {"SomeKey": "foo", "OtherKey": 1}}),
    )
    .await;

    ctx.dao
        .update_shadow_thing(&key, &json!({"reported": {"OtherKey": 2, "AnotherKey": "foobar"}}), 3)
        .await
        .unwrap();
    sync.push_cloud_update_sync_request(
        "robot-1",
        "",
        json!({"reported": {"OtherKey": 2, "AnotherKey": "foobar"}}),
    )
    .await;

    assert_eq!(queue.size().await, 1, "same-key cloud updates must coalesce");

    cloud.fail_next_update.store(true, Ordering::SeqCst);
    sync.start().await;

    // Unlike `drain`, this doesn't just wait for the queue to empty: the
    // worker dequeues the coalesced entry immediately and only then retries
    // it, so the queue is empty again well before the retried attempt lands.
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let info = ctx.dao.get_shadow_sync_information(&key).await.unwrap().unwrap();
            if info.cloud_version > 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retried cloud update did not land in time");
    sync.stop().await;

    let doc = cloud.get("robot-1", "").await.unwrap();
    assert_eq!(doc["state"]["reported"]["SomeKey"], json!("foo"));
    assert_eq!(doc["state"]["reported"]["OtherKey"], json!(2));
    assert_eq!(doc["state"]["reported"]["AnotherKey"], json!("foobar"));

    let info = ctx.dao.get_shadow_sync_information(&key).await.unwrap().unwrap();
    assert_eq!(info.cloud_version, 11);
    assert_eq!(info.local_version, 3);
}

/// Scenario 6: with direction `CloudToDevice`, local writes never produce a
/// cloud update, but a startup full sync still performs the cloud GET for
/// every configured shadow.
#[tokio::test]
async fn cloud_to_device_direction_drops_local_pushes_but_still_pulls_on_startup() {
    let (ctx, cloud) = test_context().await;
    cloud
        .seed("t1", "", json!({"state": {"desired": {"mode": "auto"}}, "version": 1}))
        .await;
    cloud
        .seed("t2", "", json!({"state": {"desired": {"mode": "manual"}}, "version": 1}))
        .await;

    let queue = Arc::new(RequestQueue::default());
    let strategy: Arc<dyn SyncStrategy> = Arc::new(RealTimeSyncStrategy::new(queue.clone(), 2));
    let sync = Arc::new(SyncHandler::new(
        ctx.clone(),
        strategy,
        vec![ShadowKey::classic("t1"), ShadowKey::classic("t2")],
        Direction::CloudToDevice,
    ));
    sync.start().await;
    sync.full_sync_on_startup().await;
    drain(&queue).await;

    // A local write on t1 is applied locally (as any IPC update would be)
    // but the resulting cloud push is dropped by the direction gate.
    let key = ShadowKey::classic("t1");
    ctx.dao
        .update_shadow_thing(&key, &json!({"desired": {"mode": "auto"}, "reported": {"mode": "auto"}}), 2)
        .await
        .unwrap();
    sync.push_cloud_update_sync_request("t1", "", json!({"reported": {"mode": "auto"}}))
        .await;
    assert_eq!(queue.size().await, 0, "CloudToDevice direction must drop cloud pushes");

    sync.stop().await;

    let local_t1 = ctx.dao.get_shadow_thing(&ShadowKey::classic("t1")).await.unwrap().unwrap();
    assert_eq!(local_t1["desired"]["mode"], json!("auto"));
    let local_t2 = ctx.dao.get_shadow_thing(&ShadowKey::classic("t2")).await.unwrap().unwrap();
    assert_eq!(local_t2["desired"]["mode"], json!("manual"));
}
