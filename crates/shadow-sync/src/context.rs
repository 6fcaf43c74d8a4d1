//! The value object handed to every `SyncRequest::execute`/`is_update_necessary`
//! call: everything a reconciliation needs and nothing that reaches back into
//! the facade. Breaks the cyclic Sync Handler <-> Strategy <-> Handler
//! ownership the spec's Design Notes calls out — the strategy only ever sees
//! a `SyncContext`, never the handler that built it.

use std::sync::Arc;

use shadow_core::config::SizeConfig;
use shadow_core::dao::ShadowDao;
use shadow_core::lock::ShadowLockTable;
use shadow_harness::clock::{Clock, SystemClock};
use shadow_harness::rate_limiter::ShadowRateLimiters;

use crate::cloud::CloudClient;
use crate::error::SyncError;

/// Shared, cloneable handle to everything a sync request's execution needs:
/// the DAO, the cloud client, the per-shadow lock table, the rate limiters,
/// the size limit, and an injectable clock.
#[derive(Clone)]
pub struct SyncContext {
    pub dao: Arc<dyn ShadowDao>,
    pub cloud: Arc<dyn CloudClient>,
    pub locks: Arc<ShadowLockTable>,
    pub rate_limiters: Arc<ShadowRateLimiters>,
    pub size: SizeConfig,
    pub clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn new(
        dao: Arc<dyn ShadowDao>,
        cloud: Arc<dyn CloudClient>,
        size: SizeConfig,
        rate_limiters: Arc<ShadowRateLimiters>,
    ) -> Self {
        Self {
            dao,
            cloud,
            locks: Arc::new(ShadowLockTable::new()),
            rate_limiters,
            size,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Consult the outbound bucket before every cloud-bound update or
    /// delete. An exhausted bucket is retryable, not a dropped request: the
    /// call site's request goes back through the Retryer/strategy loop
    /// rather than being abandoned (§8 scenario 5 requires all enqueued
    /// cloud updates to eventually complete, just throttled in rate).
    pub fn check_outbound(&self) -> Result<(), SyncError> {
        self.rate_limiters
            .check_outbound()
            .map_err(|_| SyncError::Throttled)
    }
}
