use std::{collections::BTreeSet, time::Duration};

/// The strategy that governs how failed calls are handled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClusterStrategy {
    /// A single attempt whose failure is surfaced immediately.
    #[default]
    Failfast,
    /// Failed attempts are retried according to the retry policy.
    Failover,
    /// A single attempt whose failure is replaced by an empty response.
    Failsafe,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterPolicy {
    pub strategy: ClusterStrategy,
    pub retry: Option<RetryPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of retries after the first attempt.
    pub retry: u32,
    pub interval: Duration,
    /// The total time budget, measured from the start of the first attempt.
    pub timeout: Duration,
    /// Methods that may be retried. When empty, all methods may be retried.
    pub methods: BTreeSet<String>,
    /// Response codes that indicate a retryable failure.
    pub error_codes: BTreeSet<String>,
    /// Error kinds that are retryable. When empty, every error that is not
    /// explicitly unretryable is retryable.
    pub error_kinds: BTreeSet<String>,
    /// Names the parser used to classify responses and errors.
    pub error_parser: Option<String>,
}

// === impl ClusterPolicy ===

impl ClusterPolicy {
    pub fn failover(retry: RetryPolicy) -> Self {
        Self {
            strategy: ClusterStrategy::Failover,
            retry: Some(retry),
        }
    }
}

// === impl RetryPolicy ===

impl RetryPolicy {
    pub fn new(retry: u32, interval: Duration, timeout: Duration) -> Self {
        Self {
            retry,
            interval,
            timeout,
            methods: BTreeSet::new(),
            error_codes: BTreeSet::new(),
            error_kinds: BTreeSet::new(),
            error_parser: None,
        }
    }

    pub fn is_enabled_for(&self, method: Option<&str>) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        method.map_or(false, |m| self.methods.contains(m))
    }

    pub fn is_retryable_code(&self, code: &str) -> bool {
        self.error_codes.contains(code)
    }

    pub fn is_retryable_kind(&self, kind: Option<&str>) -> bool {
        if self.error_kinds.is_empty() {
            return true;
        }
        kind.map_or(false, |k| self.error_kinds.contains(k))
    }
}
