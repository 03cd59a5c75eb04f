use livemesh_policy::SlidingWindow;
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

/// The result of a single completed call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub failed: bool,
    pub slow: bool,
}

/// Aggregated outcomes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    pub calls: u32,
    pub failures: u32,
    pub slow: u32,
}

#[derive(Debug)]
pub(crate) enum Window {
    Count {
        size: usize,
        outcomes: VecDeque<Outcome>,
        totals: Totals,
    },
    Time {
        span: Duration,
        buckets: VecDeque<Bucket>,
    },
}

#[derive(Debug)]
pub(crate) struct Bucket {
    start: Instant,
    totals: Totals,
}

const BUCKET: Duration = Duration::from_secs(1);

// === impl Totals ===

impl Totals {
    pub fn record(&mut self, outcome: Outcome) {
        self.calls += 1;
        self.failures += u32::from(outcome.failed);
        self.slow += u32::from(outcome.slow);
    }

    fn forget(&mut self, outcome: Outcome) {
        self.calls -= 1;
        self.failures -= u32::from(outcome.failed);
        self.slow -= u32::from(outcome.slow);
    }

    fn add(&mut self, other: Totals) {
        self.calls += other.calls;
        self.failures += other.failures;
        self.slow += other.slow;
    }

    pub fn failure_rate(&self) -> f32 {
        Self::percent(self.failures, self.calls)
    }

    pub fn slow_rate(&self) -> f32 {
        Self::percent(self.slow, self.calls)
    }

    /// Returns true if either rate has reached its threshold. A rate of zero
    /// never trips a breaker, even with a zero threshold.
    pub fn exceeds(&self, failure_threshold: f32, slow_threshold: f32) -> bool {
        (self.failures > 0 && self.failure_rate() >= failure_threshold)
            || (self.slow > 0 && self.slow_rate() >= slow_threshold)
    }

    fn percent(n: u32, of: u32) -> f32 {
        if of == 0 {
            return 0.0;
        }
        n as f32 * 100.0 / of as f32
    }
}

// === impl Window ===

impl Window {
    pub fn new(config: SlidingWindow) -> Self {
        match config {
            SlidingWindow::Count(size) => {
                let size = size.max(1) as usize;
                Window::Count {
                    size,
                    outcomes: VecDeque::with_capacity(size),
                    totals: Totals::default(),
                }
            }
            SlidingWindow::Time(span) => Window::Time {
                span: span.max(BUCKET),
                buckets: VecDeque::new(),
            },
        }
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        match self {
            Window::Count {
                size,
                outcomes,
                totals,
            } => {
                if outcomes.len() == *size {
                    if let Some(oldest) = outcomes.pop_front() {
                        totals.forget(oldest);
                    }
                }
                outcomes.push_back(outcome);
                totals.record(outcome);
            }
            Window::Time { span, buckets } => {
                Self::expire(buckets, *span, now);
                match buckets.back_mut() {
                    Some(bucket) if now < bucket.start + BUCKET => bucket.totals.record(outcome),
                    _ => {
                        let mut totals = Totals::default();
                        totals.record(outcome);
                        buckets.push_back(Bucket { start: now, totals });
                    }
                }
            }
        }
    }

    pub fn totals(&mut self, now: Instant) -> Totals {
        match self {
            Window::Count { totals, .. } => *totals,
            Window::Time { span, buckets } => {
                Self::expire(buckets, *span, now);
                buckets.iter().fold(Totals::default(), |mut acc, b| {
                    acc.add(b.totals);
                    acc
                })
            }
        }
    }

    fn expire(buckets: &mut VecDeque<Bucket>, span: Duration, now: Instant) {
        while let Some(bucket) = buckets.front() {
            if bucket.start + span > now {
                break;
            }
            buckets.pop_front();
        }
    }
}
