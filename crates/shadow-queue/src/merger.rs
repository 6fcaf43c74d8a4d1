//! Pure coalescing function over the `SyncRequest` variant cross-product.
//!
//! `merge(existing, new)` never touches the DAO or the cloud; it only
//! decides what a single coalesced queue entry should look like once two
//! requests for the same key collide.

use serde_json::Value;
use shadow_core::json_merge;

use crate::request::SyncRequest;

fn embedded_version(payload: &Value) -> u64 {
    payload
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn set_embedded_version(mut payload: Value, version: u64) -> Value {
    if let Value::Object(ref mut map) = payload {
        map.insert("version".into(), Value::from(version));
    }
    payload
}

/// Merge two same-sided update payloads: the request that arrived first is
/// the base, the one that arrived second overlays it, and the resulting
/// embedded `version` is the higher of the two (the newer writer's).
fn merge_update_payloads(base: &Value, overlay: &Value) -> Value {
    let merged = json_merge::merge(base, overlay);
    let version = embedded_version(base).max(embedded_version(overlay));
    set_embedded_version(merged, version)
}

pub fn merge(existing: SyncRequest, new: SyncRequest) -> SyncRequest {
    use SyncRequest::*;

    let thing = existing.thing_name().to_string();
    let shadow = existing.shadow_name().to_string();

    match (existing, new) {
        // Overwrite dominates: same side collapses to itself, opposite side
        // is a contradiction that only a full reconciliation can resolve.
        (OverwriteCloud { .. }, OverwriteCloud { .. }) => OverwriteCloud {
            thing_name: thing,
            shadow_name: shadow,
        },
        (OverwriteLocal { .. }, OverwriteLocal { .. }) => OverwriteLocal {
            thing_name: thing,
            shadow_name: shadow,
        },
        (OverwriteCloud { .. }, OverwriteLocal { .. })
        | (OverwriteLocal { .. }, OverwriteCloud { .. }) => FullSync {
            thing_name: thing,
            shadow_name: shadow,
        },
        (existing @ (OverwriteCloud { .. } | OverwriteLocal { .. }), _new) => existing,
        (_existing, new @ (OverwriteCloud { .. } | OverwriteLocal { .. })) => new,

        // FullSync absorbs anything.
        (FullSync { .. }, _) | (_, FullSync { .. }) => FullSync {
            thing_name: thing,
            shadow_name: shadow,
        },

        // MergedFullSync keeps accumulating constituents until execution
        // time, where `isUpdateNecessary` prunes the stale ones.
        (
            MergedFullSync {
                mut constituents, ..
            },
            MergedFullSync {
                constituents: more, ..
            },
        ) => {
            constituents.extend(more);
            MergedFullSync {
                thing_name: thing,
                shadow_name: shadow,
                constituents,
            }
        }
        (MergedFullSync { mut constituents, .. }, other) => {
            constituents.push(other);
            MergedFullSync {
                thing_name: thing,
                shadow_name: shadow,
                constituents,
            }
        }
        (other, MergedFullSync { mut constituents, .. }) => {
            constituents.insert(0, other);
            MergedFullSync {
                thing_name: thing,
                shadow_name: shadow,
                constituents,
            }
        }

        // Same-sided updates coalesce their payloads.
        (
            LocalUpdate { payload: a, .. },
            LocalUpdate { payload: b, .. },
        ) => LocalUpdate {
            thing_name: thing,
            shadow_name: shadow,
            payload: merge_update_payloads(&a, &b),
        },
        (
            CloudUpdate { payload: a, .. },
            CloudUpdate { payload: b, .. },
        ) => CloudUpdate {
            thing_name: thing,
            shadow_name: shadow,
            payload: merge_update_payloads(&a, &b),
        },

        // Deletes absorb updates and other deletes on the same side.
        (LocalUpdate { .. }, LocalDelete { deleted_version_hint, .. })
        | (LocalDelete { .. }, LocalDelete { deleted_version_hint, .. }) => LocalDelete {
            thing_name: thing,
            shadow_name: shadow,
            deleted_version_hint,
        },
        (LocalDelete { .. }, LocalUpdate { .. }) => LocalDelete {
            thing_name: thing,
            shadow_name: shadow,
            deleted_version_hint: None,
        },
        (CloudDelete { .. }, CloudUpdate { .. }) | (CloudDelete { .. }, CloudDelete { .. }) => {
            CloudDelete {
                thing_name: thing,
                shadow_name: shadow,
            }
        }
        (CloudUpdate { .. }, CloudDelete { .. })
        | (LocalDelete { .. }, CloudDelete { .. })
        | (CloudDelete { .. }, LocalDelete { .. }) => CloudDelete {
            thing_name: thing,
            shadow_name: shadow,
        },

        // Opposite-side collisions cannot be reduced to a single request;
        // keep both as constituents of a merged full sync.
        (existing @ (LocalUpdate { .. } | LocalDelete { .. } | CloudUpdate { .. } | CloudDelete { .. }),
         new @ (LocalUpdate { .. } | LocalDelete { .. } | CloudUpdate { .. } | CloudDelete { .. })) => {
            MergedFullSync {
                thing_name: thing,
                shadow_name: shadow,
                constituents: vec![existing, new],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_update(payload: Value) -> SyncRequest {
        SyncRequest::LocalUpdate {
            thing_name: "t1".into(),
            shadow_name: "".into(),
            payload,
        }
    }

    fn cloud_update(payload: Value) -> SyncRequest {
        SyncRequest::CloudUpdate {
            thing_name: "t1".into(),
            shadow_name: "".into(),
            payload,
        }
    }

    #[test]
    fn merge_is_idempotent_up_to_structural_equality() {
        let r = cloud_update(json!({"state": {"reported": {"a": 1}}, "version": 3}));
        let merged = merge(r.clone(), r.clone());
        assert_eq!(merged, r);
    }

    #[test]
    fn same_side_updates_merge_payloads_and_keep_newer_version() {
        let a = local_update(json!({"state": {"reported": {"SomeKey": "foo", "OtherKey": 1}}, "version": 10}));
        let b = local_update(json!({"state": {"reported": {"OtherKey": 2, "AnotherKey": "foobar"}}, "version": 11}));
        let merged = merge(a, b);
        match merged {
            SyncRequest::LocalUpdate { payload, .. } => {
                assert_eq!(payload["version"], json!(11));
                assert_eq!(payload["state"]["reported"]["SomeKey"], json!("foo"));
                assert_eq!(payload["state"]["reported"]["OtherKey"], json!(2));
                assert_eq!(payload["state"]["reported"]["AnotherKey"], json!("foobar"));
            }
            other => panic!("expected LocalUpdate, got {other:?}"),
        }
    }

    #[test]
    fn opposite_side_updates_become_merged_full_sync() {
        let a = local_update(json!({"version": 1}));
        let b = cloud_update(json!({"version": 2}));
        let merged = merge(a, b);
        assert!(matches!(merged, SyncRequest::MergedFullSync { .. }));
    }

    #[test]
    fn full_sync_absorbs_anything() {
        let a = local_update(json!({}));
        let b = SyncRequest::full_sync("t1", "");
        assert!(matches!(merge(a, b), SyncRequest::FullSync { .. }));
    }

    #[test]
    fn overwrite_same_side_collapses() {
        let a = SyncRequest::OverwriteCloud {
            thing_name: "t1".into(),
            shadow_name: "".into(),
        };
        let b = SyncRequest::OverwriteCloud {
            thing_name: "t1".into(),
            shadow_name: "".into(),
        };
        assert!(matches!(merge(a, b), SyncRequest::OverwriteCloud { .. }));
    }

    #[test]
    fn overwrite_opposite_side_forces_full_sync() {
        let a = SyncRequest::OverwriteCloud {
            thing_name: "t1".into(),
            shadow_name: "".into(),
        };
        let b = SyncRequest::OverwriteLocal {
            thing_name: "t1".into(),
            shadow_name: "".into(),
        };
        assert!(matches!(merge(a, b), SyncRequest::FullSync { .. }));
    }

    #[test]
    fn merged_full_sync_accumulates_constituents() {
        let merged = SyncRequest::MergedFullSync {
            thing_name: "t1".into(),
            shadow_name: "".into(),
            constituents: vec![local_update(json!({"version": 1}))],
        };
        let result = merge(merged, cloud_update(json!({"version": 2})));
        match result {
            SyncRequest::MergedFullSync { constituents, .. } => assert_eq!(constituents.len(), 2),
            other => panic!("expected MergedFullSync, got {other:?}"),
        }
    }
}
