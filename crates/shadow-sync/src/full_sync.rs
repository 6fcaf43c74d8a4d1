//! The full reconciliation algorithm (§4.3.5): read both sides, compare
//! against the last synced snapshot, and write whichever side(s) have fallen
//! behind. This is the path every `Conflict`/`UnknownShadow` escalation and
//! every startup sync funnels into.

use serde_json::Value;
use shadow_core::json_merge;
use shadow_core::model::{ShadowKey, SyncInformation};

use crate::context::SyncContext;
use crate::error::SyncError;

/// The `state` content of a locally-stored document: the DAO's `Value`
/// carries an injected `version` key alongside `desired`/`reported`/`delta`;
/// this strips it so comparisons and `lastSyncedDocument` snapshots never
/// see the envelope.
pub(crate) fn local_state(doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let Value::Object(ref mut map) = doc {
        map.remove("version");
    }
    doc
}

pub(crate) fn local_version(doc: &Value) -> u64 {
    doc.get("version").and_then(Value::as_u64).unwrap_or(0)
}

/// The cloud document is wire-shaped (`{"state": {...}, "version": n}`),
/// matching the shape the IPC surface and MQTT payloads use.
pub(crate) fn cloud_state(doc: &Value) -> Value {
    doc.get("state").cloned().unwrap_or(Value::Object(Default::default()))
}

pub(crate) fn cloud_version(doc: &Value) -> u64 {
    doc.get("version").and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn wire(state: &Value, version: u64) -> Value {
    serde_json::json!({ "state": state, "version": version })
}

pub(crate) fn last_synced(info: &SyncInformation) -> Option<Value> {
    info.last_synced_document
        .as_ref()
        .and_then(|bytes| serde_json::from_slice(bytes).ok())
}

pub(crate) fn snapshot(state: &Value) -> Option<Vec<u8>> {
    serde_json::to_vec(state).ok()
}

pub(crate) async fn load_or_create_sync_info(
    ctx: &SyncContext,
    key: &ShadowKey,
) -> Result<SyncInformation, SyncError> {
    if let Some(info) = ctx.dao.get_shadow_sync_information(key).await? {
        return Ok(info);
    }
    let info = SyncInformation::new(key, ctx.now_epoch_secs());
    ctx.dao.insert_sync_info_if_not_exists(&info).await?;
    Ok(info)
}

/// Run one full reconciliation pass for `key`, holding the per-shadow lock
/// for its entire duration so no IPC write or other sync execution can
/// interleave.
pub async fn full_sync(ctx: &SyncContext, key: &ShadowKey) -> Result<(), SyncError> {
    let _guard = ctx.locks.lock(key).await;

    let local = ctx.dao.get_shadow_thing(key).await?;
    let mut info = load_or_create_sync_info(ctx, key).await?;
    let cloud = ctx.cloud.get_thing_shadow(&key.thing_name, &key.shadow_name).await?;

    match (local, cloud) {
        (None, None) => {
            if !info.cloud_deleted {
                info.cloud_deleted = true;
                info.last_synced_document = None;
                persist(ctx, &mut info).await?;
            }
        }
        (None, Some(c)) => pull_cloud_only(ctx, key, &mut info, &c).await?,
        (Some(l), None) => push_local_only(ctx, key, &mut info, &l).await?,
        (Some(l), Some(c)) => reconcile_both(ctx, key, &mut info, &l, &c).await?,
    }

    Ok(())
}

async fn pull_cloud_only(
    ctx: &SyncContext,
    key: &ShadowKey,
    info: &mut SyncInformation,
    cloud_doc: &Value,
) -> Result<(), SyncError> {
    let c_version = cloud_version(cloud_doc);

    if info.cloud_deleted && c_version == info.cloud_version + 1 {
        ctx.check_outbound()?;
        ctx.cloud
            .delete_thing_shadow(&key.thing_name, &key.shadow_name)
            .await?;
        info.cloud_version = c_version;
        persist(ctx, info).await?;
        return Ok(());
    }

    let c_state = cloud_state(cloud_doc);
    let result = ctx
        .dao
        .update_shadow_thing(key, &c_state, info.local_version + 1)
        .await?;
    let Some(result) = result else {
        return Err(SyncError::Skip("local version advanced mid-reconciliation".into()));
    };

    info.local_version = result.version;
    info.cloud_version = c_version;
    info.last_synced_document = snapshot(&c_state);
    info.cloud_deleted = false;
    persist(ctx, info).await?;
    Ok(())
}

async fn push_local_only(
    ctx: &SyncContext,
    key: &ShadowKey,
    info: &mut SyncInformation,
    local_doc: &Value,
) -> Result<(), SyncError> {
    let l_version = local_version(local_doc);

    if info.cloud_deleted && l_version == info.local_version {
        ctx.dao.delete_shadow_thing(key).await?;
        let deleted = ctx.dao.get_deleted_shadow_version(key).await?;
        info.local_version = deleted.unwrap_or(l_version + 1);
        persist(ctx, info).await?;
        return Ok(());
    }

    let l_state = local_state(local_doc);
    ctx.check_outbound()?;
    ctx.cloud
        .update_thing_shadow(
            &key.thing_name,
            &key.shadow_name,
            &wire(&l_state, info.cloud_version),
        )
        .await?;

    info.cloud_version += 1;
    info.local_version = l_version;
    info.last_synced_document = snapshot(&l_state);
    info.cloud_deleted = false;
    persist(ctx, info).await?;
    Ok(())
}

async fn reconcile_both(
    ctx: &SyncContext,
    key: &ShadowKey,
    info: &mut SyncInformation,
    local_doc: &Value,
    cloud_doc: &Value,
) -> Result<(), SyncError> {
    let l_state = local_state(local_doc);
    let c_state = cloud_state(cloud_doc);
    let l_version = local_version(local_doc);
    let c_version = cloud_version(cloud_doc);
    let prior = last_synced(info);

    let local_changed = prior.as_ref().map(|p| p != &l_state).unwrap_or(true);
    let cloud_changed = prior.as_ref().map(|p| p != &c_state).unwrap_or(true);

    match (local_changed, cloud_changed) {
        (false, false) => {}
        (true, false) => {
            let overlay = match &prior {
                Some(p) => json_merge::diff(p, &l_state),
                None => l_state.clone(),
            };
            ctx.check_outbound()?;
            ctx.cloud
                .update_thing_shadow(
                    &key.thing_name,
                    &key.shadow_name,
                    &wire(&overlay, info.cloud_version),
                )
                .await?;
            info.cloud_version += 1;
            info.local_version = l_version;
            info.last_synced_document = snapshot(&l_state);
            info.cloud_deleted = false;
        }
        (false, true) => {
            let overlay = match &prior {
                Some(p) => json_merge::diff(p, &c_state),
                None => c_state.clone(),
            };
            let result = ctx
                .dao
                .update_shadow_thing(key, &overlay, info.local_version + 1)
                .await?;
            let Some(result) = result else {
                return Err(SyncError::Skip("local version advanced mid-reconciliation".into()));
            };
            info.local_version = result.version;
            info.cloud_version = c_version;
            info.last_synced_document = snapshot(&c_state);
            info.cloud_deleted = false;
        }
        (true, true) => {
            let base = prior.unwrap_or(Value::Object(Default::default()));
            let local_diff = json_merge::diff(&base, &l_state);
            let cloud_diff = json_merge::diff(&base, &c_state);
            let merged = json_merge::merge(&json_merge::merge(&base, &cloud_diff), &local_diff);

            let local_overlay = json_merge::diff(&l_state, &merged);
            let result = ctx
                .dao
                .update_shadow_thing(key, &local_overlay, info.local_version + 1)
                .await?;
            let Some(result) = result else {
                return Err(SyncError::Skip("local version advanced mid-reconciliation".into()));
            };

            let cloud_overlay = json_merge::diff(&c_state, &merged);
            ctx.check_outbound()?;
            ctx.cloud
                .update_thing_shadow(
                    &key.thing_name,
                    &key.shadow_name,
                    &wire(&cloud_overlay, info.cloud_version),
                )
                .await?;

            info.local_version = result.version;
            info.cloud_version += 1;
            info.last_synced_document = snapshot(&merged);
            info.cloud_deleted = false;
        }
    }

    persist(ctx, info).await?;
    Ok(())
}

pub(crate) async fn persist(ctx: &SyncContext, info: &mut SyncInformation) -> Result<(), SyncError> {
    info.last_sync_time = ctx.now_epoch_secs();
    ctx.dao.update_sync_information(info).await?;
    Ok(())
}
