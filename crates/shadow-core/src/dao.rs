//! The Shadow DAO: transactional persistence for shadow documents and sync
//! metadata. The spec treats this as an external collaborator — this crate
//! defines the trait it consumes and ships one concrete implementation
//! (`SqliteShadowDao`, in [`crate::sqlite_dao`]) backed by `tokio-rusqlite`,
//! following `at_core::cache::CacheDb`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{ShadowKey, SyncInformation};

/// Outcome of a successful [`ShadowDao::update_shadow_thing`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowUpdateResult {
    pub version: u64,
    pub current_document: Value,
}

#[async_trait]
pub trait ShadowDao: Send + Sync {
    /// Fetch the live document for `key`, or `None` if it has never been
    /// created or has been deleted.
    async fn get_shadow_thing(&self, key: &ShadowKey) -> Result<Option<Value>, CoreError>;

    /// Apply `overlay` to the current document's state under optimistic
    /// concurrency: the write succeeds only if `version` is exactly one
    /// greater than the shadow's current version (0 if the shadow does not
    /// yet exist). Returns `None` on a version mismatch, `Some(..)` with the
    /// merged document and its new version on success.
    async fn update_shadow_thing(
        &self,
        key: &ShadowKey,
        overlay: &Value,
        version: u64,
    ) -> Result<Option<ShadowUpdateResult>, CoreError>;

    /// Delete the live document for `key`. Returns the document as it was
    /// immediately before deletion, or `None` if it was already absent.
    async fn delete_shadow_thing(&self, key: &ShadowKey) -> Result<Option<Value>, CoreError>;

    /// The version assigned to the most recent deletion of `key`, if any.
    async fn get_deleted_shadow_version(&self, key: &ShadowKey) -> Result<Option<u64>, CoreError>;

    async fn get_shadow_sync_information(
        &self,
        key: &ShadowKey,
    ) -> Result<Option<SyncInformation>, CoreError>;

    /// Upsert sync info, overwriting whatever was previously stored.
    async fn update_sync_information(&self, info: &SyncInformation) -> Result<bool, CoreError>;

    /// Insert sync info only if none exists yet for this key. Returns `true`
    /// if a row was inserted, `false` if one already existed.
    async fn insert_sync_info_if_not_exists(
        &self,
        info: &SyncInformation,
    ) -> Result<bool, CoreError>;

    async fn delete_sync_information(&self, key: &ShadowKey) -> Result<bool, CoreError>;

    /// All (thing, shadow) pairs that currently have sync metadata.
    async fn list_synced_shadows(&self) -> Result<Vec<ShadowKey>, CoreError>;

    /// Named shadows (classic excluded) for `thing_name`, paginated.
    /// Negative `offset`/`limit` are ignored (treated as "no bound").
    async fn list_named_shadows_for_thing(
        &self,
        thing_name: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<String>, CoreError>;
}
