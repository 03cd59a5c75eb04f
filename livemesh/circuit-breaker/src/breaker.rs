use crate::window::{Outcome, Totals, Window};
use livemesh_policy::CircuitBreakPolicy;
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, trace};

pub struct CircuitBreaker {
    policy: Arc<CircuitBreakPolicy>,
    resource: Arc<str>,
    instance: Option<Arc<str>>,
    inner: Mutex<Inner>,
    listeners: Vec<Arc<dyn StateListener>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

/// Admission of one call through a [`CircuitBreaker`].
///
/// Reporting the call's outcome consumes the permit. A permit dropped without
/// an outcome, e.g. because the call was cancelled, is released.
#[must_use]
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    reported: bool,
}

/// Describes a state change of a breaker.
#[derive(Clone, Debug)]
pub struct Transition<'a> {
    pub policy_id: u64,
    pub resource: &'a str,
    /// The endpoint an instance-level breaker guards.
    pub instance: Option<&'a str>,
    pub from: State,
    pub to: State,
    /// When an open breaker will admit trial calls.
    pub until: Option<Instant>,
}

/// Observes breaker state changes.
///
/// Listeners are notified after the breaker's lock is released, so they may
/// query the breaker.
pub trait StateListener: Send + Sync + 'static {
    fn on_transition(&self, transition: &Transition<'_>);
}

#[derive(Debug)]
enum Inner {
    Closed(Window),
    Open {
        until: Instant,
    },
    HalfOpen {
        /// Trial calls that may still be admitted.
        permits: u32,
        results: Totals,
    },
}

// === impl CircuitBreaker ===

impl CircuitBreaker {
    pub fn new(
        policy: Arc<CircuitBreakPolicy>,
        resource: impl Into<Arc<str>>,
        instance: Option<Arc<str>>,
        listeners: Vec<Arc<dyn StateListener>>,
    ) -> Self {
        let window = Window::new(policy.window);
        Self {
            policy,
            resource: resource.into(),
            instance,
            inner: Mutex::new(Inner::Closed(window)),
            listeners,
        }
    }

    pub fn policy(&self) -> &Arc<CircuitBreakPolicy> {
        &self.policy
    }

    pub fn resource(&self) -> &Arc<str> {
        &self.resource
    }

    pub fn instance(&self) -> Option<&Arc<str>> {
        self.instance.as_ref()
    }

    pub fn state(&self) -> State {
        if self.policy.force_open {
            return State::Open;
        }
        match *self.inner.lock() {
            Inner::Closed(_) => State::Closed,
            Inner::Open { .. } => State::Open,
            Inner::HalfOpen { .. } => State::HalfOpen,
        }
    }

    /// Requests permission for one call.
    ///
    /// A breaker that has been open for `wait_in_open` moves to half-open and
    /// admits `permitted_calls_in_half_open` trial calls. Every call admitted
    /// here must be followed by exactly one outcome report.
    pub fn acquire(&self) -> bool {
        if self.policy.force_open {
            trace!(resource = %self.resource, "Breaker forced open");
            return false;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        let transition = match &mut *inner {
            Inner::Closed(_) => return true,
            Inner::HalfOpen { permits, .. } => {
                if *permits == 0 {
                    return false;
                }
                *permits -= 1;
                return true;
            }
            Inner::Open { until } if now < *until => return false,
            Inner::Open { .. } => {
                *inner = Inner::HalfOpen {
                    permits: self.half_open_permits() - 1,
                    results: Totals::default(),
                };
                (State::Open, State::HalfOpen, None)
            }
        };
        drop(inner);

        self.notify(transition);
        true
    }

    /// Like [`CircuitBreaker::acquire`], returning a [`Permit`] that gives
    /// the admission back if it is dropped without an outcome.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        self.acquire().then(|| Permit {
            breaker: self.clone(),
            reported: false,
        })
    }

    pub fn on_success(&self, elapsed: Duration) {
        self.record(false, elapsed);
    }

    /// Records a call that failed with an error of the given kind. Errors
    /// whose kind the policy does not track count as successes.
    pub fn on_error(&self, elapsed: Duration, kind: Option<&str>) {
        self.record(self.policy.is_failure_kind(kind), elapsed);
    }

    /// Records a call that completed with a response code.
    pub fn on_response(&self, elapsed: Duration, code: &str) {
        self.record(self.policy.is_failure_code(code), elapsed);
    }

    /// Returns an admitted call's permission without recording an outcome,
    /// for calls that were rejected locally before reaching the resource.
    pub fn release(&self) {
        if let Inner::HalfOpen { permits, results } = &mut *self.inner.lock() {
            if results.calls + *permits < self.half_open_permits() {
                *permits += 1;
            }
        }
    }

    fn record(&self, failed: bool, elapsed: Duration) {
        let outcome = Outcome {
            failed,
            slow: elapsed >= self.policy.slow_call_duration,
        };
        let now = Instant::now();

        let mut inner = self.inner.lock();
        let transition = match &mut *inner {
            Inner::Closed(window) => {
                window.record(outcome, now);
                let totals = window.totals(now);
                if totals.calls < self.policy.minimum_calls.max(1) || !self.exceeds(&totals) {
                    return;
                }
                debug!(
                    resource = %self.resource,
                    calls = totals.calls,
                    failure_rate = totals.failure_rate(),
                    slow_rate = totals.slow_rate(),
                    "Breaker thresholds exceeded",
                );
                let until = now + self.policy.wait_in_open;
                *inner = Inner::Open { until };
                (State::Closed, State::Open, Some(until))
            }
            // Calls admitted before the breaker opened are ignored.
            Inner::Open { .. } => return,
            Inner::HalfOpen { results, .. } => {
                results.record(outcome);
                if results.calls < self.half_open_permits() {
                    return;
                }
                if self.exceeds(results) {
                    let until = now + self.policy.wait_in_open;
                    *inner = Inner::Open { until };
                    (State::HalfOpen, State::Open, Some(until))
                } else {
                    *inner = Inner::Closed(Window::new(self.policy.window));
                    (State::HalfOpen, State::Closed, None)
                }
            }
        };
        drop(inner);

        self.notify(transition);
    }

    fn exceeds(&self, totals: &Totals) -> bool {
        totals.exceeds(
            self.policy.failure_rate_threshold,
            self.policy.slow_call_rate_threshold,
        )
    }

    fn half_open_permits(&self) -> u32 {
        self.policy.permitted_calls_in_half_open.max(1)
    }

    fn notify(&self, (from, to, until): (State, State, Option<Instant>)) {
        info!(
            resource = %self.resource,
            instance = self.instance.as_deref().unwrap_or("-"),
            policy = self.policy.id,
            ?from,
            ?to,
            "Circuit breaker transitioned",
        );
        let transition = Transition {
            policy_id: self.policy.id,
            resource: &self.resource,
            instance: self.instance.as_deref(),
            from,
            to,
            until,
        };
        for listener in &self.listeners {
            listener.on_transition(&transition);
        }
    }
}

// === impl Permit ===

impl Permit {
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn success(mut self, elapsed: Duration) {
        self.reported = true;
        self.breaker.on_success(elapsed);
    }

    pub fn error(mut self, elapsed: Duration, kind: Option<&str>) {
        self.reported = true;
        self.breaker.on_error(elapsed, kind);
    }

    pub fn response(mut self, elapsed: Duration, code: &str) {
        self.reported = true;
        self.breaker.on_response(elapsed, code);
    }

    /// Gives the admission back without recording an outcome.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.reported {
            trace!(resource = %self.breaker.resource, "Releasing breaker permit");
            self.breaker.release();
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("policy", &self.policy.id)
            .field("resource", &self.resource)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livemesh_policy::SlidingWindow;
    use tokio::time;

    fn policy() -> CircuitBreakPolicy {
        CircuitBreakPolicy {
            window: SlidingWindow::Count(4),
            minimum_calls: 4,
            failure_rate_threshold: 50.0,
            wait_in_open: Duration::from_secs(10),
            ..CircuitBreakPolicy::new(1)
        }
    }

    fn breaker(policy: CircuitBreakPolicy) -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(policy), "orders", None, Vec::new())
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..4 {
            assert!(breaker.acquire());
            breaker.on_error(Duration::from_millis(1), None);
        }
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn waits_for_minimum_calls() {
        let _trace = livemesh_tracing::test::trace_init();
        let breaker = breaker(policy());
        for _ in 0..3 {
            assert!(breaker.acquire());
            breaker.on_error(Duration::from_millis(1), None);
        }
        assert_eq!(breaker.state(), State::Closed);

        assert!(breaker.acquire());
        breaker.on_success(Duration::from_millis(1));
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.acquire());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn admits_one_trial_call_after_cooldown() {
        let _trace = livemesh_tracing::test::trace_init();
        let breaker = breaker(policy());
        trip(&breaker);

        time::advance(Duration::from_secs(9)).await;
        assert!(!breaker.acquire());

        time::advance(Duration::from_secs(1)).await;
        assert!(breaker.acquire(), "trial call must be admitted");
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(!breaker.acquire(), "only one trial call may be admitted");

        breaker.on_success(Duration::from_millis(1));
        assert_eq!(breaker.state(), State::Closed);
        assert!(breaker.acquire());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_trial_call_reopens() {
        let _trace = livemesh_tracing::test::trace_init();
        let breaker = breaker(policy());
        trip(&breaker);

        time::advance(Duration::from_secs(10)).await;
        assert!(breaker.acquire());
        breaker.on_error(Duration::from_millis(1), None);
        assert_eq!(breaker.state(), State::Open);

        time::advance(Duration::from_secs(5)).await;
        assert!(!breaker.acquire());
        time::advance(Duration::from_secs(5)).await;
        assert!(breaker.acquire());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn slow_calls_trip() {
        let breaker = breaker(CircuitBreakPolicy {
            slow_call_rate_threshold: 75.0,
            slow_call_duration: Duration::from_millis(100),
            ..policy()
        });
        for _ in 0..3 {
            assert!(breaker.acquire());
            breaker.on_success(Duration::from_millis(150));
        }
        assert!(breaker.acquire());
        breaker.on_success(Duration::from_millis(10));
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn untracked_failures_count_as_success() {
        let mut policy = policy();
        policy.error_kinds.insert("connect".to_string());
        policy.error_codes.insert("503".to_string());
        let breaker = breaker(policy);

        for _ in 0..4 {
            assert!(breaker.acquire());
            breaker.on_error(Duration::from_millis(1), Some("validation"));
        }
        assert_eq!(breaker.state(), State::Closed);

        for _ in 0..2 {
            assert!(breaker.acquire());
            breaker.on_response(Duration::from_millis(1), "503");
        }
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn released_trial_call_is_readmitted() {
        let breaker = breaker(policy());
        trip(&breaker);
        time::advance(Duration::from_secs(10)).await;

        assert!(breaker.acquire());
        assert!(!breaker.acquire());
        breaker.release();
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(breaker.acquire());
        breaker.release();
        breaker.release();
        assert!(breaker.acquire());
        assert!(!breaker.acquire(), "releases must not mint permits");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn dropped_permits_are_released() {
        let breaker = Arc::new(breaker(policy()));
        trip(&breaker);
        time::advance(Duration::from_secs(10)).await;

        let trial = breaker.try_acquire().expect("trial call must be admitted");
        assert!(breaker.try_acquire().is_none());
        drop(trial);
        assert_eq!(breaker.state(), State::HalfOpen);

        let trial = breaker.try_acquire().expect("trial call must be readmitted");
        trial.success(Duration::from_millis(1));
        assert_eq!(breaker.state(), State::Closed);

        // Reported permits do not release on drop.
        let permit = breaker.try_acquire().expect("closed");
        permit.error(Duration::from_millis(1), None);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn force_open_rejects() {
        let breaker = breaker(CircuitBreakPolicy {
            force_open: true,
            ..policy()
        });
        assert!(!breaker.acquire());
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn notifies_listeners() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<(State, State)>>);
        impl StateListener for Recorder {
            fn on_transition(&self, t: &Transition<'_>) {
                self.0.lock().push((t.from, t.to));
            }
        }

        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn StateListener> = recorder.clone();
        let breaker = CircuitBreaker::new(Arc::new(policy()), "orders", None, vec![listener]);
        trip(&breaker);
        time::advance(Duration::from_secs(10)).await;
        assert!(breaker.acquire());
        breaker.on_success(Duration::from_millis(1));

        assert_eq!(
            *recorder.0.lock(),
            vec![
                (State::Closed, State::Open),
                (State::Open, State::HalfOpen),
                (State::HalfOpen, State::Closed),
            ]
        );
    }
}
