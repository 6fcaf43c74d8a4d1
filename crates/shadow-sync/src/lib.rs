//! The synchronization engine: cloud connectivity, the sync request
//! execution contracts, the two scheduling strategies, MQTT-driven
//! connectivity, the direction gate, and the facade that ties them
//! together for IPC handlers and the daemon binary.

pub mod cloud;
pub mod context;
pub mod direction;
pub mod error;
pub mod full_sync;
pub mod handler;
pub mod mqtt;
pub mod requests;
pub mod strategy;

pub use cloud::{CloudClient, CloudError, ReqwestCloudClient};
pub use context::SyncContext;
pub use direction::{Direction, DirectionGate};
pub use error::{classify, SyncError};
pub use full_sync::full_sync;
pub use handler::SyncHandler;
pub use mqtt::{LocalRequestSink, MqttTopicManager};
pub use strategy::{PeriodicSyncStrategy, RealTimeSyncStrategy, SyncStrategy};
