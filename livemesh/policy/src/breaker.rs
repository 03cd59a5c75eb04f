use std::{collections::BTreeMap, collections::BTreeSet, time::Duration};

/// Whether a breaker guards a whole service or each of its endpoints.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BreakerLevel {
    #[default]
    Service,
    Instance,
}

/// How outcomes are aggregated to compute failure rates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlidingWindow {
    /// The last `n` calls.
    Count(u32),
    /// Calls completed within the trailing duration, in one-second buckets.
    Time(Duration),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakPolicy {
    pub id: u64,
    /// Changes whenever the policy is edited so that a reload starts from
    /// fresh state.
    pub version: u64,
    pub level: BreakerLevel,
    pub window: SlidingWindow,
    /// Calls that must be recorded before rates are evaluated.
    pub minimum_calls: u32,
    /// Percentage of failed calls at or above which the breaker opens.
    pub failure_rate_threshold: f32,
    /// Percentage of slow calls at or above which the breaker opens.
    pub slow_call_rate_threshold: f32,
    pub slow_call_duration: Duration,
    pub wait_in_open: Duration,
    pub permitted_calls_in_half_open: u32,
    /// Response codes counted as failures. Errors always count.
    pub error_codes: BTreeSet<String>,
    /// Error kinds counted as failures. When empty, every error counts.
    pub error_kinds: BTreeSet<String>,
    pub degrade: Option<DegradeConfig>,
    pub force_open: bool,
}

/// A canned response returned in place of an error when a breaker is open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DegradeConfig {
    pub code: String,
    pub content_type: Option<String>,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

// === impl CircuitBreakPolicy ===

impl CircuitBreakPolicy {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            version: 0,
            level: BreakerLevel::Service,
            window: SlidingWindow::Count(100),
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration: Duration::from_secs(60),
            wait_in_open: Duration::from_secs(60),
            permitted_calls_in_half_open: 1,
            error_codes: BTreeSet::new(),
            error_kinds: BTreeSet::new(),
            degrade: None,
            force_open: false,
        }
    }

    pub fn is_failure_code(&self, code: &str) -> bool {
        self.error_codes.contains(code)
    }

    pub fn is_failure_kind(&self, kind: Option<&str>) -> bool {
        if self.error_kinds.is_empty() {
            return true;
        }
        kind.map_or(false, |k| self.error_kinds.contains(k))
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        let percent = 0.0..=100.0;
        if !percent.contains(&self.failure_rate_threshold) {
            return Err("failure rate threshold must be within 0..=100");
        }
        if !percent.contains(&self.slow_call_rate_threshold) {
            return Err("slow call rate threshold must be within 0..=100");
        }
        match self.window {
            SlidingWindow::Count(0) => return Err("count window must be non-zero"),
            SlidingWindow::Time(d) if d < Duration::from_secs(1) => {
                return Err("time window must be at least one second")
            }
            _ => {}
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err("half-open state must permit at least one call");
        }
        Ok(())
    }
}
