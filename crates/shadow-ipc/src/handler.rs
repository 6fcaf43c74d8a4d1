//! The IPC handler facade (§6 "IPC handler interfaces exposed TO callers").
//! An in-process struct, not a wire server — the transport is out of scope
//! (see [`crate::transport`] for the loopback stand-in used in tests) —
//! following `at_bridge::ipc::IpcHandler`'s shape: shared state behind
//! `Arc`, one `async fn handle_xxx` per operation, a typed `Result`.

use std::sync::Arc;

use serde_json::Value;
use shadow_core::config::SizeConfig;
use shadow_core::model::ShadowKey;
use shadow_core::ShadowDao;
use shadow_harness::ShadowRateLimiters;
use shadow_sync::SyncHandler;
use tracing::info;

use crate::error::{IpcError, Result};

/// Response to a successful `handleUpdate` call.
#[derive(Debug, Clone)]
pub struct UpdateResponse {
    pub payload: Value,
    pub current_document: Value,
    pub version: u64,
}

/// Response to a successful `handleListNamedShadowsForThing` call. `next_token`
/// is `None` once the caller has paged through every named shadow.
#[derive(Debug, Clone)]
pub struct NamedShadowPage {
    pub names: Vec<String>,
    pub next_token: Option<String>,
}

fn payload_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

fn decode_next_token(token: Option<&str>) -> Result<i64> {
    match token {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| IpcError::InvalidArguments("malformed nextToken".to_string())),
    }
}

pub struct ShadowIpcHandler {
    dao: Arc<dyn ShadowDao>,
    rate_limiters: Arc<ShadowRateLimiters>,
    sync: Arc<SyncHandler>,
    size: SizeConfig,
}

impl ShadowIpcHandler {
    pub fn new(
        dao: Arc<dyn ShadowDao>,
        rate_limiters: Arc<ShadowRateLimiters>,
        sync: Arc<SyncHandler>,
        size: SizeConfig,
    ) -> Self {
        Self {
            dao,
            rate_limiters,
            sync,
            size,
        }
    }

    /// `handleGet(thing, shadow) -> payload` — throttled by inbound buckets;
    /// `ResourceNotFound` if the shadow has never existed or was deleted.
    pub async fn handle_get(&self, thing_name: &str, shadow_name: &str) -> Result<Value> {
        self.rate_limiters.check_inbound(thing_name)?;
        let key = ShadowKey::new(thing_name, shadow_name);
        self.dao
            .get_shadow_thing(&key)
            .await?
            .ok_or(IpcError::ResourceNotFound)
    }

    /// `handleUpdate(request, serviceName) -> {payload, currentDocument}` —
    /// validates payload size against the configured limit, applies the
    /// overlay under optimistic concurrency (`version` must be exactly one
    /// past the shadow's current version), and on success enqueues a
    /// `CloudUpdate` sync request carrying the same overlay.
    pub async fn handle_update(
        &self,
        thing_name: &str,
        shadow_name: &str,
        overlay: Value,
        version: u64,
    ) -> Result<UpdateResponse> {
        self.rate_limiters.check_inbound(thing_name)?;

        let size = payload_size(&overlay);
        let limit = self.size.effective_limit();
        if size > limit {
            return Err(IpcError::InvalidArguments(format!(
                "payload of {size} bytes exceeds the {limit}-byte limit"
            )));
        }

        let key = ShadowKey::new(thing_name, shadow_name);
        let result = self
            .dao
            .update_shadow_thing(&key, &overlay, version)
            .await?
            .ok_or(IpcError::Conflict)?;

        self.sync
            .push_cloud_update_sync_request(thing_name, shadow_name, overlay)
            .await;

        info!(thing = thing_name, shadow = shadow_name, version = result.version, "shadow updated locally");
        Ok(UpdateResponse {
            payload: result.current_document.clone(),
            current_document: result.current_document,
            version: result.version,
        })
    }

    /// `handleDelete(request, serviceName) -> {}` — removes the live
    /// document and, on success, enqueues a `CloudDelete` sync request.
    pub async fn handle_delete(&self, thing_name: &str, shadow_name: &str) -> Result<()> {
        self.rate_limiters.check_inbound(thing_name)?;

        let key = ShadowKey::new(thing_name, shadow_name);
        self.dao
            .delete_shadow_thing(&key)
            .await?
            .ok_or(IpcError::ResourceNotFound)?;

        self.sync
            .push_cloud_delete_sync_request(thing_name, shadow_name)
            .await;

        info!(thing = thing_name, shadow = shadow_name, "shadow deleted locally");
        Ok(())
    }

    /// `handleListNamedShadowsForThing(thing, pageSize, nextToken)` —
    /// `nextToken` is an opaque string encoding the row offset to resume
    /// from; negative page sizes are rejected rather than silently ignored,
    /// since this is a caller-facing paging contract rather than the DAO's
    /// internal "negative means unbounded" convention.
    pub async fn handle_list_named_shadows_for_thing(
        &self,
        thing_name: &str,
        page_size: i64,
        next_token: Option<&str>,
    ) -> Result<NamedShadowPage> {
        if page_size <= 0 {
            return Err(IpcError::InvalidArguments(
                "pageSize must be positive".to_string(),
            ));
        }
        self.rate_limiters.check_inbound(thing_name)?;

        let offset = decode_next_token(next_token)?;
        let names = self
            .dao
            .list_named_shadows_for_thing(thing_name, offset, page_size)
            .await?;

        let next_token = if names.len() as i64 == page_size {
            Some((offset + page_size).to_string())
        } else {
            None
        };

        Ok(NamedShadowPage { names, next_token })
    }
}
