//! Retry-with-backoff for sync operations against the cloud, built on the
//! same closed/open-ended state-machine shape as a circuit breaker but
//! scoped to a single call: classify the failure, decide whether another
//! attempt is worth making, and back off exponentially between attempts.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

/// How a failed attempt should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient — worth another attempt (throttling, 5xx, network errors).
    Retryable,
    /// Permanent and uninteresting — stop, drop the request, no error surfaced.
    Skip,
    /// The cloud rejected the write due to a version mismatch — stop and let
    /// the caller fall back to a full sync.
    Conflict,
    /// The shadow does not exist server-side — stop, caller decides whether
    /// to create it.
    UnknownShadow,
    /// Shutdown was requested mid-retry — stop without another attempt.
    Interrupted,
}

impl ErrorClass {
    fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// The policy used for ordinary per-request retries: 5 attempts,
    /// starting at 3s and doubling up to a 60s cap.
    pub fn default_policy() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    /// The policy used once the default policy is exhausted and the engine
    /// falls back to a coarser retry: 3 attempts, starting at 30s and
    /// doubling up to a 120s cap.
    pub fn fallback_policy() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
        }
    }

    /// The delay before the attempt numbered `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let scaled = self.base_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("exhausted {attempts} attempts, last error: {source}")]
    Exhausted { attempts: u32, source: E },
    #[error("request skipped: {source}")]
    Skipped { source: E },
    #[error("version conflict: {source}")]
    Conflict { source: E },
    #[error("shadow not known to the cloud: {source}")]
    UnknownShadow { source: E },
    #[error("retry interrupted by shutdown")]
    Interrupted,
}

/// Drives one logical operation through a [`BackoffPolicy`], classifying
/// each failure to decide whether to retry, and optionally falling back to a
/// coarser policy once the primary one is exhausted.
#[derive(Debug)]
pub struct Retryer {
    primary: BackoffPolicy,
    fallback: Option<BackoffPolicy>,
    clock: std::sync::Arc<dyn Clock>,
}

impl Retryer {
    pub fn new(primary: BackoffPolicy) -> Self {
        Self {
            primary,
            fallback: None,
            clock: std::sync::Arc::new(SystemClock),
        }
    }

    pub fn with_fallback(mut self, fallback: BackoffPolicy) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_clock(mut self, clock: std::sync::Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run `f`, retrying per the configured policy/policies until it
    /// succeeds, a non-retryable classification is hit, or `should_stop`
    /// reports a shutdown in progress.
    pub async fn run<F, Fut, T, E>(
        &self,
        classify: impl Fn(&E) -> ErrorClass,
        should_stop: impl Fn() -> bool,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policies: Vec<BackoffPolicy> = match self.fallback {
            Some(fallback) => vec![self.primary, fallback],
            None => vec![self.primary],
        };

        let mut last_err = None;
        let mut total_attempts = 0u32;

        for policy in policies {
            for attempt in 1..=policy.max_attempts {
                if should_stop() {
                    return Err(RetryError::Interrupted);
                }

                total_attempts += 1;
                match f().await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        let class = classify(&err);
                        match class {
                            ErrorClass::Skip => return Err(RetryError::Skipped { source: err }),
                            ErrorClass::Conflict => {
                                return Err(RetryError::Conflict { source: err })
                            }
                            ErrorClass::UnknownShadow => {
                                return Err(RetryError::UnknownShadow { source: err })
                            }
                            ErrorClass::Interrupted => return Err(RetryError::Interrupted),
                            ErrorClass::Retryable => {
                                if !class.is_retryable() || attempt == policy.max_attempts {
                                    last_err = Some(err);
                                    break;
                                }
                                let delay = policy.delay_for_attempt(attempt);
                                debug!(attempt, ?delay, "retrying after transient failure");
                                last_err = Some(err);
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                }
            }
        }

        warn!(attempts = total_attempts, "retry policy exhausted");
        Err(RetryError::Exhausted {
            attempts: total_attempts,
            source: last_err.expect("loop always sets last_err before falling through"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_doubles_until_cap() {
        let policy = BackoffPolicy::default_policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(12));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(24));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(48));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry_on_first_try() {
        let retryer = Retryer::new(BackoffPolicy::default_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), &str> = retryer
            .run(
                |_: &&str| ErrorClass::Retryable,
                || false,
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_policy_exhausted() {
        let retryer = Retryer::new(BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        });
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), &str> = retryer
            .run(
                |_: &&str| ErrorClass::Retryable,
                || false,
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err("boom") }
                },
            )
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_coarser_policy_after_primary_exhausted() {
        let retryer = Retryer::new(BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        })
        .with_fallback(BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        });
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), &str> = retryer
            .run(
                |_: &&str| ErrorClass::Retryable,
                || false,
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err("boom") }
                },
            )
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_stops_immediately() {
        let retryer = Retryer::new(BackoffPolicy::default_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), &str> = retryer
            .run(
                |_: &&str| ErrorClass::Conflict,
                || false,
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err("version mismatch") }
                },
            )
            .await;
        assert!(matches!(result, Err(RetryError::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_interrupts_before_next_attempt() {
        let retryer = Retryer::new(BackoffPolicy::default_policy());
        let result: Result<(), &str> = retryer
            .run(|_: &&str| ErrorClass::Retryable, || true, || async { Err("boom") })
            .await;
        assert!(matches!(result, Err(RetryError::Interrupted)));
    }
}
