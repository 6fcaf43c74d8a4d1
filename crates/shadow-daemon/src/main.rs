//! shadow-sync daemon — loads configuration, wires the DAO, cloud client,
//! rate limiters, sync engine, and MQTT topic manager, then runs until
//! ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use tracing::info;

use shadow_core::config::{Config, DirectionConfig, StrategyKind};
use shadow_core::SqliteShadowDao;
use shadow_harness::rate_limiter::ShadowRateLimiters;
use shadow_harness::shutdown::ShutdownSignal;
use shadow_ipc::{LoopbackTransport, ShadowIpcHandler};
use shadow_queue::RequestQueue;
use shadow_sync::cloud::ReqwestCloudClient;
use shadow_sync::context::SyncContext;
use shadow_sync::direction::Direction;
use shadow_sync::mqtt::MqttTopicManager;
use shadow_sync::strategy::{PeriodicSyncStrategy, RealTimeSyncStrategy, SyncStrategy};
use shadow_sync::SyncHandler;

mod logging;

const REAL_TIME_PARALLELISM: usize = 4;
const MQTT_EVENT_CAPACITY: usize = 64;
const IPC_TRANSPORT_CAPACITY: usize = 64;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/{rest}")
    } else {
        path.to_string()
    }
}

fn load_config() -> Result<Config> {
    let mut args = std::env::args().skip(1);
    if let Some(flag) = args.next() {
        if flag == "--config" {
            let path = args.next().context("--config requires a path argument")?;
            return Config::load_from(path).context("failed to load config from --config path");
        }
    }
    Config::load().context("failed to load config")
}

fn direction_from_config(config: &DirectionConfig) -> Direction {
    match config {
        DirectionConfig::BetweenDeviceAndCloud => Direction::BetweenDeviceAndCloud,
        DirectionConfig::DeviceToCloud => Direction::DeviceToCloud,
        DirectionConfig::CloudToDevice => Direction::CloudToDevice,
    }
}

fn build_strategy(kind: StrategyKind, delay_secs: u64, queue: Arc<RequestQueue>) -> Arc<dyn SyncStrategy> {
    match kind {
        StrategyKind::RealTime => Arc::new(RealTimeSyncStrategy::new(queue, REAL_TIME_PARALLELISM)),
        StrategyKind::Periodic => {
            Arc::new(PeriodicSyncStrategy::new(queue, Duration::from_secs(delay_secs)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    match config.log_format.as_str() {
        "json" => logging::init_logging_json("shadow-daemon", "info"),
        _ => logging::init_logging("shadow-daemon", "info"),
    }

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "shadow-daemon starting");

    let dao_path = expand_tilde(&config.dao.path);
    if let Some(parent) = std::path::Path::new(&dao_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    let dao: Arc<dyn shadow_core::ShadowDao> = Arc::new(
        SqliteShadowDao::open(&dao_path)
            .await
            .with_context(|| format!("failed to open shadow database at {dao_path}"))?,
    );

    let cloud = Arc::new(ReqwestCloudClient::new(
        config.cloud.endpoint.clone(),
        Duration::from_secs(config.cloud.timeout_secs),
    ));
    let rate_limiters = Arc::new(ShadowRateLimiters::new(&config.rate_limits));
    let ctx = SyncContext::new(dao.clone(), cloud, config.size.clone(), rate_limiters.clone());

    let sync_set = config.synchronize_set();
    let queue = Arc::new(RequestQueue::default());
    let strategy = build_strategy(config.strategy.kind, config.strategy.delay, queue);
    let direction = direction_from_config(&config.direction);

    let sync = Arc::new(SyncHandler::new(ctx, strategy, sync_set.clone(), direction));
    sync.start().await;
    sync.full_sync_on_startup().await;
    info!(shadows = sync_set.len(), "initial full sync enqueued");

    let ipc_handler = Arc::new(ShadowIpcHandler::new(
        dao,
        rate_limiters,
        sync.clone(),
        config.size.clone(),
    ));
    let (_ipc_client, ipc_server) = LoopbackTransport::new(ipc_handler, IPC_TRANSPORT_CAPACITY);
    tokio::spawn(ipc_server.run());

    let shutdown = ShutdownSignal::new();
    let mut mqtt_options = MqttOptions::new(
        config.mqtt.client_id.clone(),
        config.mqtt.broker_host.clone(),
        config.mqtt.broker_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (mqtt_client, mqtt_eventloop) = AsyncClient::new(mqtt_options, MQTT_EVENT_CAPACITY);

    let mqtt_manager = Arc::new(MqttTopicManager::new(mqtt_client, sync.clone(), shutdown.clone()));
    mqtt_manager.set_target(sync_set).await;
    tokio::spawn(mqtt_manager.run(mqtt_eventloop));

    info!("shadow-daemon ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    shutdown.trigger();
    sync.stop().await;

    info!("shadow-daemon stopped");
    Ok(())
}
