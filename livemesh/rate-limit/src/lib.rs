//! Token-bucket rate limiting.
//!
//! A [`RateLimiter`] admits `permits` calls per `period`. Callers that find
//! the bucket empty may wait for a permit when the policy configures a
//! `max_wait` that covers the time until the next token is available.
//!
//! Buckets are measured against tokio's clock, so waits and refills agree
//! when the runtime's time is paused.

#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

use ahash::AHashMap;
use governor::{
    clock::Clock,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use livemesh_policy::RateLimitPolicy;
use parking_lot::Mutex;
use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub struct RateLimiter {
    id: u64,
    version: u64,
    max_wait: Option<Duration>,
    clock: TokioClock,
    bucket: governor::RateLimiter<NotKeyed, InMemoryState, TokioClock>,
}

/// Reads time from the current tokio runtime, falling back to the system's
/// monotonic clock outside of one.
#[derive(Clone, Copy, Debug, Default)]
struct TokioClock;

/// Caches one limiter per policy, rebuilding it when the policy's version
/// changes.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<AHashMap<u64, Arc<RateLimiter>>>,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("rate limit {id} exceeded; next permit in {retry_after:?}")]
pub struct RateLimited {
    pub id: u64,
    pub retry_after: Duration,
}

// === impl RateLimiter ===

impl RateLimiter {
    /// Returns `None` if the policy does not describe a usable rate.
    pub fn new(policy: &RateLimitPolicy) -> Option<Self> {
        let permits = NonZeroU32::new(policy.permits)?;
        let quota = Quota::with_period(policy.period / policy.permits)?.allow_burst(permits);
        Some(Self {
            id: policy.id,
            version: policy.version,
            max_wait: policy.max_wait,
            clock: TokioClock,
            bucket: governor::RateLimiter::direct_with_clock(quota, TokioClock),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Takes a permit if one is immediately available.
    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        self.bucket.check().map_err(|not_until| RateLimited {
            id: self.id,
            retry_after: not_until.wait_time_from(self.clock.now()),
        })
    }

    /// Takes a permit, waiting up to the policy's `max_wait` for one.
    pub async fn acquire(&self) -> Result<(), RateLimited> {
        let limited = match self.try_acquire() {
            Ok(()) => return Ok(()),
            Err(limited) => limited,
        };

        match self.max_wait {
            Some(max) if limited.retry_after <= max => {}
            _ => {
                trace!(id = self.id, retry_after = ?limited.retry_after, "Rate limited");
                return Err(limited);
            }
        }

        debug!(id = self.id, wait = ?limited.retry_after, "Waiting for rate limit permit");
        tokio::time::sleep(limited.retry_after).await;
        self.try_acquire()
    }
}

// === impl TokioClock ===

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

// === impl RateLimiterRegistry ===

impl RateLimiterRegistry {
    pub fn get(&self, policy: &RateLimitPolicy) -> Option<Arc<RateLimiter>> {
        let mut limiters = self.limiters.lock();
        if let Some(limiter) = limiters.get(&policy.id) {
            if limiter.version == policy.version {
                return Some(limiter.clone());
            }
        }

        let Some(limiter) = RateLimiter::new(policy) else {
            warn!(id = policy.id, permits = policy.permits, period = ?policy.period, "Ignoring unusable rate limit");
            limiters.remove(&policy.id);
            return None;
        };
        debug!(id = policy.id, version = policy.version, "Built rate limiter");
        let limiter = Arc::new(limiter);
        limiters.insert(policy.id, limiter.clone());
        Some(limiter)
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.lock().is_empty()
    }
}
