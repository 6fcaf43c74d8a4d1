//! Token-bucket rate limiting, generalized from a single keyed limiter to the
//! three named tiers the sync engine enforces: outbound updates to the
//! cloud, total inbound local requests, and per-thing inbound local
//! requests.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::warn;

use shadow_core::config::RateLimitsConfig;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for key `{key}` – retry after {retry_after:?}")]
    Exceeded { key: String, retry_after: Duration },
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub tokens_per_second: f64,
    pub max_burst: f64,
}

impl RateLimitConfig {
    pub fn per_second(count: u32) -> Self {
        Self {
            tokens_per_second: count as f64,
            max_burst: count as f64,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.max_burst = burst as f64;
        self
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    fn new(now: std::time::Instant, max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: now,
        }
    }

    fn try_consume(
        &mut self,
        now: std::time::Instant,
        cost: f64,
        tokens_per_second: f64,
        max_burst: f64,
    ) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_burst);
        self.last_refill = now;

        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            Err(Duration::from_secs_f64(deficit / tokens_per_second))
        }
    }
}

/// A single keyed token-bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock,
        }
    }

    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(now, self.config.max_burst));

        match bucket.try_consume(now, 1.0, self.config.tokens_per_second, self.config.max_burst) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                warn!(key, ?retry_after, "rate limit exceeded");
                Err(RateLimitError::Exceeded {
                    key: key.to_string(),
                    retry_after,
                })
            }
        }
    }
}

/// The three rate-limit tiers enforced around sync traffic, per the
/// configured `rateLimits` section: an outbound bucket shared by all
/// cloud-bound updates, an inbound bucket shared by all local requests, and
/// an inbound bucket scoped to a single thing.
#[derive(Debug)]
pub struct ShadowRateLimiters {
    outbound_cloud: RateLimiter,
    inbound_total: RateLimiter,
    inbound_per_thing: RateLimiter,
}

impl ShadowRateLimiters {
    pub fn new(config: &RateLimitsConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &RateLimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            outbound_cloud: RateLimiter::with_clock(
                RateLimitConfig::per_second(config.max_outbound_sync_updates_per_second),
                clock.clone(),
            ),
            inbound_total: RateLimiter::with_clock(
                RateLimitConfig::per_second(config.max_total_local_requests_rate),
                clock.clone(),
            ),
            inbound_per_thing: RateLimiter::with_clock(
                RateLimitConfig::per_second(config.max_local_requests_per_second_per_thing),
                clock,
            ),
        }
    }

    /// Check the outbound bucket shared by every request pushed to the cloud.
    pub fn check_outbound(&self) -> Result<(), RateLimitError> {
        self.outbound_cloud.check("outbound")
    }

    /// Check both the total-inbound bucket and the per-thing bucket for
    /// `thing_name`; the first exceeded tier wins.
    pub fn check_inbound(&self, thing_name: &str) -> Result<(), RateLimitError> {
        self.inbound_total.check("inbound")?;
        self.inbound_per_thing.check(thing_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn burst_within_capacity_succeeds() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(5).with_burst(5));
        for _ in 0..5 {
            limiter.check("k").unwrap();
        }
        assert!(limiter.check("k").is_err());
    }

    #[test]
    fn fake_clock_refills_bucket_deterministically() {
        let clock = Arc::new(FakeClock::new());
        let limiter = RateLimiter::with_clock(RateLimitConfig::per_second(1), clock.clone());
        limiter.check("k").unwrap();
        assert!(limiter.check("k").is_err());

        clock.advance(Duration::from_secs(1));
        limiter.check("k").unwrap();
    }

    #[test]
    fn inbound_tiers_are_independent_per_thing() {
        let config = RateLimitsConfig {
            max_outbound_sync_updates_per_second: 100,
            max_total_local_requests_rate: 2,
            max_local_requests_per_second_per_thing: 100,
        };
        let limiters = ShadowRateLimiters::new(&config);
        limiters.check_inbound("a").unwrap();
        limiters.check_inbound("b").unwrap();
        assert!(limiters.check_inbound("c").is_err());
    }

    #[test]
    fn per_thing_tier_limits_independent_of_total() {
        let config = RateLimitsConfig {
            max_outbound_sync_updates_per_second: 100,
            max_total_local_requests_rate: 100,
            max_local_requests_per_second_per_thing: 1,
        };
        let limiters = ShadowRateLimiters::new(&config);
        limiters.check_inbound("a").unwrap();
        assert!(limiters.check_inbound("a").is_err());
        limiters.check_inbound("b").unwrap();
    }
}
