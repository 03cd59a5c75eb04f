use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug)]
pub struct Counter {
    id: Arc<str>,
    active: AtomicUsize,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    elapsed_ms: AtomicU64,
    max_elapsed_ms: AtomicU64,
    pub(crate) last_seen: AtomicU64,
}

/// Admission for a single in-flight call.
#[must_use = "a permit must be completed with `success` or `fail`"]
#[derive(Debug)]
pub struct Permit {
    counter: Arc<Counter>,
    started: Instant,
    done: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub active: usize,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub elapsed: Duration,
    pub max_elapsed: Duration,
}

// === impl Counter ===

impl Counter {
    pub(crate) fn new(id: Arc<str>, generation: u64) -> Self {
        Self {
            id,
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            elapsed_ms: AtomicU64::new(0),
            max_elapsed_ms: AtomicU64::new(0),
            last_seen: AtomicU64::new(generation),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    /// Attempts to admit one more concurrent call.
    ///
    /// Returns `None` when `max_active` calls are already in flight.
    pub fn begin(self: &Arc<Self>, max_active: Option<usize>) -> Option<Permit> {
        let mut active = self.active.load(Ordering::Acquire);
        loop {
            if let Some(max) = max_active {
                if active >= max {
                    trace!(endpoint = %self.id, active, max, "Counter saturated");
                    return None;
                }
            }
            match self.active.compare_exchange_weak(
                active,
                active + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => active = current,
            }
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        Some(Permit {
            counter: self.clone(),
            started: Instant::now(),
            done: false,
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            active: self.active(),
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            elapsed: Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed)),
            max_elapsed: Duration::from_millis(self.max_elapsed_ms.load(Ordering::Relaxed)),
        }
    }

    fn end(&self, elapsed: Duration, success: bool) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_elapsed_ms.fetch_max(ms, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let prior = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior > 0, "counter must not underflow");
    }
}

// === impl Permit ===

impl Permit {
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn counter(&self) -> &Arc<Counter> {
        &self.counter
    }

    pub fn success(mut self, elapsed: Duration) {
        self.done = true;
        self.counter.end(elapsed, true);
    }

    pub fn fail(mut self, elapsed: Duration) {
        self.done = true;
        self.counter.end(elapsed, false);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.done {
            // The call was abandoned before it completed.
            self.counter.end(self.started.elapsed(), false);
        }
    }
}
