use std::time::Duration;

/// Limits the number of concurrent calls to each endpoint of a service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConcurrencyLimitPolicy {
    pub max_active: usize,
}

/// A token bucket that admits `permits` calls per `period`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RateLimitPolicy {
    pub id: u64,
    pub version: u64,
    pub permits: u32,
    pub period: Duration,
    /// How long a caller may wait for a permit before being rejected.
    pub max_wait: Option<Duration>,
}

// === impl RateLimitPolicy ===

impl RateLimitPolicy {
    pub fn new(id: u64, permits: u32, period: Duration) -> Self {
        Self {
            id,
            version: 0,
            permits,
            period,
            max_wait: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.permits == 0 {
            return Err("permits must be non-zero");
        }
        if self.period.is_zero() {
            return Err("period must be non-zero");
        }
        Ok(())
    }
}
