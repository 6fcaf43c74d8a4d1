//! Core data model, persistence, configuration, and JSON merge semantics
//! shared by every shadow-sync crate.

pub mod config;
pub mod dao;
pub mod error;
pub mod json_merge;
pub mod lock;
pub mod model;
pub mod sqlite_dao;

pub use config::Config;
pub use dao::{ShadowDao, ShadowUpdateResult};
pub use error::{CoreError, Result};
pub use lock::{ShadowLockGuard, ShadowLockTable};
pub use model::{ShadowDocument, ShadowKey, SyncInformation};
pub use sqlite_dao::SqliteShadowDao;
