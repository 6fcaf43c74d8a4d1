//! Execution contracts for the six atomic `SyncRequest` variants (§4.3.1–
//! 4.3.4, 4.3.6, 4.3.7). `FullSync`'s own reconciliation algorithm (§4.3.5)
//! lives in [`crate::full_sync`]; this module dispatches to it for `FullSync`
//! and for `MergedFullSync` requests that cannot reduce to a single
//! same-sided request.

use serde_json::Value;
use shadow_core::model::ShadowKey;
use shadow_queue::SyncRequest;
use tracing::debug;

use crate::context::SyncContext;
use crate::error::SyncError;
use crate::full_sync::{
    cloud_state, cloud_version, full_sync, load_or_create_sync_info, local_state, local_version,
    persist, snapshot, wire,
};

fn embedded_version(payload: &Value) -> u64 {
    payload.get("version").and_then(Value::as_u64).unwrap_or(0)
}

/// The precheck every variant runs before `execute`: does executing this
/// request have any remaining effect given current DAO state? Side effects
/// are limited to the opportunistic `cloudVersion` bump called out in §4.3.
pub async fn is_update_necessary(
    ctx: &SyncContext,
    request: &SyncRequest,
) -> Result<bool, SyncError> {
    match request {
        SyncRequest::LocalUpdate {
            thing_name,
            shadow_name,
            payload,
        } => {
            let key = ShadowKey::new(thing_name.clone(), shadow_name.clone());
            let Some(info) = ctx.dao.get_shadow_sync_information(&key).await? else {
                return Err(SyncError::UnknownShadow);
            };
            Ok(embedded_version(payload) > info.cloud_version)
        }
        SyncRequest::LocalDelete {
            thing_name,
            shadow_name,
            ..
        } => {
            let key = ShadowKey::new(thing_name.clone(), shadow_name.clone());
            let Some(info) = ctx.dao.get_shadow_sync_information(&key).await? else {
                return Err(SyncError::UnknownShadow);
            };
            Ok(!info.cloud_deleted)
        }
        SyncRequest::CloudUpdate {
            thing_name,
            shadow_name,
            ..
        } => {
            let key = ShadowKey::new(thing_name.clone(), shadow_name.clone());
            Ok(ctx.dao.get_shadow_thing(&key).await?.is_some())
        }
        SyncRequest::CloudDelete {
            thing_name,
            shadow_name,
        } => {
            let key = ShadowKey::new(thing_name.clone(), shadow_name.clone());
            match ctx.dao.get_shadow_sync_information(&key).await? {
                Some(info) => Ok(!info.cloud_deleted),
                None => Err(SyncError::UnknownShadow),
            }
        }
        SyncRequest::FullSync { .. } => Ok(true),
        SyncRequest::OverwriteCloud { .. } | SyncRequest::OverwriteLocal { .. } => Ok(true),
        SyncRequest::MergedFullSync { constituents, .. } => {
            for c in constituents {
                if Box::pin(is_update_necessary(ctx, c)).await.unwrap_or(true) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Run `request` to completion, serialized per-shadow by the lock held
/// inside each variant's handler (`full_sync` acquires it itself; the atomic
/// variants acquire it here).
pub async fn execute(ctx: &SyncContext, request: SyncRequest) -> Result<(), SyncError> {
    match request {
        SyncRequest::LocalUpdate {
            thing_name,
            shadow_name,
            payload,
        } => execute_local_update(ctx, thing_name, shadow_name, payload).await,
        SyncRequest::LocalDelete {
            thing_name,
            shadow_name,
            deleted_version_hint,
        } => execute_local_delete(ctx, thing_name, shadow_name, deleted_version_hint).await,
        SyncRequest::CloudUpdate {
            thing_name,
            shadow_name,
            payload,
        } => execute_cloud_update(ctx, thing_name, shadow_name, payload).await,
        SyncRequest::CloudDelete {
            thing_name,
            shadow_name,
        } => execute_cloud_delete(ctx, thing_name, shadow_name).await,
        SyncRequest::FullSync {
            thing_name,
            shadow_name,
        } => full_sync(ctx, &ShadowKey::new(thing_name, shadow_name)).await,
        SyncRequest::OverwriteCloud {
            thing_name,
            shadow_name,
        } => execute_overwrite_cloud(ctx, thing_name, shadow_name).await,
        SyncRequest::OverwriteLocal {
            thing_name,
            shadow_name,
        } => execute_overwrite_local(ctx, thing_name, shadow_name).await,
        SyncRequest::MergedFullSync {
            thing_name,
            shadow_name,
            constituents,
        } => execute_merged_full_sync(ctx, thing_name, shadow_name, constituents).await,
    }
}

/// §4.3.1 — apply a cloud-originated update locally.
async fn execute_local_update(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
    payload: Value,
) -> Result<(), SyncError> {
    let key = ShadowKey::new(thing_name, shadow_name);
    let _guard = ctx.locks.lock(&key).await;

    let mut info = load_or_create_sync_info(ctx, &key).await?;
    let cloud_update = embedded_version(&payload);

    if cloud_update <= info.cloud_version {
        debug!(%key, cloud_update, cloud_version = info.cloud_version, "local update already subsumed");
        return Ok(());
    }
    if cloud_update > info.cloud_version + 1 {
        return Err(SyncError::Cloud(crate::cloud::CloudError::Conflict(
            format!("missed cloud update: expected {}, got {cloud_update}", info.cloud_version + 1),
        )));
    }

    let overlay = cloud_state(&payload);
    let result = ctx
        .dao
        .update_shadow_thing(&key, &overlay, info.local_version + 1)
        .await?;
    let Some(result) = result else {
        return Err(SyncError::Skip("local version advanced mid-update".into()));
    };

    info.local_version = result.version;
    info.cloud_version = cloud_update;
    info.last_synced_document = snapshot(&overlay);
    info.cloud_deleted = false;
    persist(ctx, &mut info).await
}

/// §4.3.2 — apply a cloud-originated delete locally.
async fn execute_local_delete(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
    deleted_cloud_version: Option<u64>,
) -> Result<(), SyncError> {
    let key = ShadowKey::new(thing_name, shadow_name);
    let _guard = ctx.locks.lock(&key).await;

    let mut info = ctx
        .dao
        .get_shadow_sync_information(&key)
        .await?
        .ok_or(SyncError::UnknownShadow)?;

    ctx.dao.delete_shadow_thing(&key).await?;
    let deleted_local_version = ctx
        .dao
        .get_deleted_shadow_version(&key)
        .await?
        .unwrap_or(info.local_version + 1);

    info.local_version = deleted_local_version;
    info.cloud_version = deleted_cloud_version.unwrap_or(info.cloud_version + 1);
    info.cloud_deleted = true;
    info.last_synced_document = None;
    persist(ctx, &mut info).await
}

/// §4.3.3 — push a local change to the cloud.
async fn execute_cloud_update(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
    payload: Value,
) -> Result<(), SyncError> {
    let key = ShadowKey::new(thing_name, shadow_name);
    let _guard = ctx.locks.lock(&key).await;

    let Some(local) = ctx.dao.get_shadow_thing(&key).await? else {
        debug!(%key, "no local source, dropping cloud update");
        return Ok(());
    };

    let mut info = load_or_create_sync_info(ctx, &key).await?;
    let overlay = shadow_core::json_merge::merge(&local_state(&local), &payload);
    let outgoing = wire(&overlay, info.cloud_version);

    ctx.check_outbound()?;
    ctx.cloud
        .update_thing_shadow(&key.thing_name, &key.shadow_name, &outgoing)
        .await?;

    info.cloud_version += 1;
    info.local_version = local_version(&local);
    info.last_synced_document = snapshot(&overlay);
    info.cloud_deleted = false;
    info.cloud_update_time = ctx.now_epoch_secs();
    persist(ctx, &mut info).await
}

/// §4.3.4 — push a local deletion to the cloud.
async fn execute_cloud_delete(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
) -> Result<(), SyncError> {
    let key = ShadowKey::new(thing_name, shadow_name);
    let _guard = ctx.locks.lock(&key).await;

    let mut info = ctx
        .dao
        .get_shadow_sync_information(&key)
        .await?
        .ok_or(SyncError::UnknownShadow)?;

    if info.cloud_deleted {
        return Ok(());
    }

    ctx.check_outbound()?;
    ctx.cloud
        .delete_thing_shadow(&key.thing_name, &key.shadow_name)
        .await?;

    info.cloud_version += 1;
    info.local_version = ctx
        .dao
        .get_deleted_shadow_version(&key)
        .await?
        .unwrap_or(info.local_version + 1);
    info.cloud_deleted = true;
    info.last_synced_document = None;
    persist(ctx, &mut info).await
}

/// §4.3.7 — force the local state onto the cloud, or delete the cloud
/// shadow if local is absent.
async fn execute_overwrite_cloud(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
) -> Result<(), SyncError> {
    let key = ShadowKey::new(thing_name, shadow_name);
    let _guard = ctx.locks.lock(&key).await;

    let local = ctx.dao.get_shadow_thing(&key).await?;
    let mut info = load_or_create_sync_info(ctx, &key).await?;

    match local {
        None => {
            ctx.check_outbound()?;
            ctx.cloud
                .delete_thing_shadow(&key.thing_name, &key.shadow_name)
                .await?;
            info.cloud_version += 1;
            info.cloud_deleted = true;
            info.last_synced_document = None;
        }
        Some(doc) => {
            let state = local_state(&doc);
            ctx.check_outbound()?;
            ctx.cloud
                .update_thing_shadow(&key.thing_name, &key.shadow_name, &wire(&state, info.cloud_version))
                .await?;
            info.cloud_version += 1;
            info.local_version = local_version(&doc);
            info.last_synced_document = snapshot(&state);
            info.cloud_deleted = false;
        }
    }
    persist(ctx, &mut info).await
}

/// §4.3.7 — force the cloud state onto the local store, or delete local if
/// the cloud shadow is absent.
async fn execute_overwrite_local(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
) -> Result<(), SyncError> {
    let key = ShadowKey::new(thing_name, shadow_name);
    let _guard = ctx.locks.lock(&key).await;

    let cloud = ctx.cloud.get_thing_shadow(&key.thing_name, &key.shadow_name).await?;
    let mut info = load_or_create_sync_info(ctx, &key).await?;

    match cloud {
        None => {
            ctx.dao.delete_shadow_thing(&key).await?;
            info.local_version = ctx
                .dao
                .get_deleted_shadow_version(&key)
                .await?
                .unwrap_or(info.local_version + 1);
            info.cloud_deleted = true;
            info.last_synced_document = None;
        }
        Some(doc) => {
            let state = cloud_state(&doc);
            let result = ctx
                .dao
                .update_shadow_thing(&key, &state, info.local_version + 1)
                .await?
                .ok_or_else(|| SyncError::Skip("local version advanced mid-overwrite".into()))?;
            info.local_version = result.version;
            info.cloud_version = cloud_version(&doc);
            info.last_synced_document = snapshot(&state);
            info.cloud_deleted = false;
        }
    }
    persist(ctx, &mut info).await
}

/// §4.3.6 — re-check each constituent, drop the stale ones, and either
/// collapse same-sided survivors into one merged request or fall back to a
/// full reconciliation.
async fn execute_merged_full_sync(
    ctx: &SyncContext,
    thing_name: String,
    shadow_name: String,
    constituents: Vec<SyncRequest>,
) -> Result<(), SyncError> {
    let mut remaining = Vec::with_capacity(constituents.len());
    for c in constituents {
        if is_update_necessary(ctx, &c).await? {
            remaining.push(c);
        }
    }

    if remaining.is_empty() {
        return Ok(());
    }

    let all_cloud = remaining.iter().all(|r| matches!(r, SyncRequest::CloudUpdate { .. }));
    let all_local = remaining.iter().all(|r| matches!(r, SyncRequest::LocalUpdate { .. }));

    if all_cloud || all_local {
        let mut reduced = remaining.remove(0);
        for next in remaining {
            reduced = shadow_queue::merge(reduced, next);
        }
        return Box::pin(execute(ctx, reduced)).await;
    }

    full_sync(ctx, &ShadowKey::new(thing_name, shadow_name)).await
}
