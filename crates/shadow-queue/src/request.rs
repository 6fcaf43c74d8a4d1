//! The closed set of pending sync work items. A `SyncRequest` is owned
//! exclusively by the queue until dequeued, then by the executing worker
//! until it succeeds, is skipped, or fails terminally.

use serde_json::Value;
use shadow_core::model::ShadowKey;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// A cloud-originated update to apply locally. `payload` carries the
    /// producing update's embedded `version` (interpreted as the cloud
    /// version), per §4.3.1.
    LocalUpdate {
        thing_name: String,
        shadow_name: String,
        payload: Value,
    },
    /// A cloud-originated delete to apply locally.
    LocalDelete {
        thing_name: String,
        shadow_name: String,
        deleted_version_hint: Option<u64>,
    },
    /// A local change to push to the cloud.
    CloudUpdate {
        thing_name: String,
        shadow_name: String,
        payload: Value,
    },
    /// A local deletion to push to the cloud.
    CloudDelete {
        thing_name: String,
        shadow_name: String,
    },
    /// Reconcile both sides from scratch.
    FullSync {
        thing_name: String,
        shadow_name: String,
    },
    /// Force the local state onto the cloud, ignoring divergence analysis.
    OverwriteCloud {
        thing_name: String,
        shadow_name: String,
    },
    /// Force the cloud state onto the local store, ignoring divergence
    /// analysis.
    OverwriteLocal {
        thing_name: String,
        shadow_name: String,
    },
    /// The coalesced result of merging requests that could not reduce to a
    /// single same-sided request; keeps the flat list of original
    /// constituents for `isUpdateNecessary` re-evaluation at execution time.
    MergedFullSync {
        thing_name: String,
        shadow_name: String,
        constituents: Vec<SyncRequest>,
    },
}

impl SyncRequest {
    pub fn thing_name(&self) -> &str {
        match self {
            SyncRequest::LocalUpdate { thing_name, .. }
            | SyncRequest::LocalDelete { thing_name, .. }
            | SyncRequest::CloudUpdate { thing_name, .. }
            | SyncRequest::CloudDelete { thing_name, .. }
            | SyncRequest::FullSync { thing_name, .. }
            | SyncRequest::OverwriteCloud { thing_name, .. }
            | SyncRequest::OverwriteLocal { thing_name, .. }
            | SyncRequest::MergedFullSync { thing_name, .. } => thing_name,
        }
    }

    pub fn shadow_name(&self) -> &str {
        match self {
            SyncRequest::LocalUpdate { shadow_name, .. }
            | SyncRequest::LocalDelete { shadow_name, .. }
            | SyncRequest::CloudUpdate { shadow_name, .. }
            | SyncRequest::CloudDelete { shadow_name, .. }
            | SyncRequest::FullSync { shadow_name, .. }
            | SyncRequest::OverwriteCloud { shadow_name, .. }
            | SyncRequest::OverwriteLocal { shadow_name, .. }
            | SyncRequest::MergedFullSync { shadow_name, .. } => shadow_name,
        }
    }

    pub fn key(&self) -> ShadowKey {
        ShadowKey::new(self.thing_name().to_string(), self.shadow_name().to_string())
    }

    pub fn full_sync(thing_name: impl Into<String>, shadow_name: impl Into<String>) -> Self {
        SyncRequest::FullSync {
            thing_name: thing_name.into(),
            shadow_name: shadow_name.into(),
        }
    }

    /// A short tag used in logs and in the merger's dispatch table; does not
    /// distinguish `OverwriteCloud` from `OverwriteLocal`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SyncRequest::LocalUpdate { .. } => "LocalUpdate",
            SyncRequest::LocalDelete { .. } => "LocalDelete",
            SyncRequest::CloudUpdate { .. } => "CloudUpdate",
            SyncRequest::CloudDelete { .. } => "CloudDelete",
            SyncRequest::FullSync { .. } => "FullSync",
            SyncRequest::OverwriteCloud { .. } => "OverwriteCloud",
            SyncRequest::OverwriteLocal { .. } => "OverwriteLocal",
            SyncRequest::MergedFullSync { .. } => "MergedFullSync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_combines_thing_and_shadow() {
        let r = SyncRequest::CloudUpdate {
            thing_name: "t1".into(),
            shadow_name: "cfg".into(),
            payload: json!({}),
        };
        assert_eq!(r.key(), ShadowKey::new("t1", "cfg"));
    }

    #[test]
    fn full_sync_constructor_builds_classic_key() {
        let r = SyncRequest::full_sync("t1", "");
        assert!(r.key().is_classic());
        assert_eq!(r.kind_name(), "FullSync");
    }
}
