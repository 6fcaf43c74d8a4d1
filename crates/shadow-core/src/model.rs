//! Shadow documents and per-shadow sync metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies a single shadow: a thing plus an optional shadow name.
///
/// The classic shadow uses the empty string as its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShadowKey {
    pub thing_name: String,
    pub shadow_name: String,
}

impl ShadowKey {
    pub fn new(thing_name: impl Into<String>, shadow_name: impl Into<String>) -> Self {
        Self {
            thing_name: thing_name.into(),
            shadow_name: shadow_name.into(),
        }
    }

    pub fn classic(thing_name: impl Into<String>) -> Self {
        Self::new(thing_name, "")
    }

    pub fn is_classic(&self) -> bool {
        self.shadow_name.is_empty()
    }
}

impl std::fmt::Display for ShadowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_classic() {
            write!(f, "{}", self.thing_name)
        } else {
            write!(f, "{}/{}", self.thing_name, self.shadow_name)
        }
    }
}

/// A versioned JSON shadow document.
///
/// `state` carries the recognized `desired`/`reported`/`delta` keys but is
/// otherwise opaque to this crate — document structure validation belongs to
/// the shadow JSON grammar, which is an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowDocument {
    pub thing_name: String,
    pub shadow_name: String,
    pub state: Value,
    #[serde(default)]
    pub metadata: Value,
    pub version: u64,
    pub timestamp: i64,
}

impl ShadowDocument {
    pub fn key(&self) -> ShadowKey {
        ShadowKey::new(self.thing_name.clone(), self.shadow_name.clone())
    }

    /// The reported/desired state without the `version`/`metadata` envelope,
    /// suitable for use as a "last synced document" snapshot.
    pub fn state_only(&self) -> Value {
        self.state.clone()
    }
}

/// Per-(thing, shadow) sync bookkeeping.
///
/// `cloud_deleted == true` must always coincide with
/// `last_synced_document.is_none()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncInformation {
    pub thing_name: String,
    pub shadow_name: String,
    pub last_synced_document: Option<Vec<u8>>,
    pub cloud_version: u64,
    pub local_version: u64,
    pub cloud_update_time: i64,
    pub last_sync_time: i64,
    pub cloud_deleted: bool,
}

impl SyncInformation {
    /// A freshly-created sync record for a shadow that has just entered the
    /// synchronize set, at version 0 on both sides.
    pub fn new(key: &ShadowKey, now: i64) -> Self {
        Self {
            thing_name: key.thing_name.clone(),
            shadow_name: key.shadow_name.clone(),
            last_synced_document: None,
            cloud_version: 0,
            local_version: 0,
            cloud_update_time: now,
            last_sync_time: now,
            cloud_deleted: false,
        }
    }

    pub fn key(&self) -> ShadowKey {
        ShadowKey::new(self.thing_name.clone(), self.shadow_name.clone())
    }

    /// Assert the invariant that `cloud_deleted` and `last_synced_document`
    /// agree; used defensively at assembly points, never on the hot path.
    pub fn check_invariant(&self) -> bool {
        self.cloud_deleted == self.last_synced_document.is_none()
    }
}
