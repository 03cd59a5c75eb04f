use super::{completion, invoke_once, unready, Completion};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::{is_unretryable, ErrorCause, RetryExhausted, RetryTimeout},
    Config, InvocationContext,
};
use livemesh_error::{Error, Result};
use livemesh_policy::RetryPolicy;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, trace, warn};

/// Retries allowed by a failover call whose service has no retry policy.
const DEFAULT_RETRIES: u32 = 2;

/// How the retries of a failover call are scheduled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// Retries wait out their interval and run on the caller's task, so
    /// dropping the caller's future cancels them.
    #[default]
    Inline,
    /// The first attempt runs on the caller's task. Retries are handed to
    /// the context's retry executor and run even if the caller goes away.
    Detached,
}

/// The classification of an attempt's outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Retryable {
    /// The outcome is final.
    None,
    Retry,
    /// The retry budget is spent.
    Exhausted,
    /// The deadline has passed.
    Timeout,
}

/// The retry state of one failover call.
#[derive(Debug)]
pub struct RetryContext {
    policy: RetryPolicy,
    retries: AtomicU32,
    started: Instant,
    deadline: Instant,
}

enum Step<R> {
    Done(R),
    Retry(u32),
}

struct Detached<C: LiveCluster> {
    ctx: Arc<InvocationContext<C>>,
    cluster: Arc<C>,
    retry: RetryContext,
    inv: Arc<Mutex<Invocation<C>>>,
    completion: Completion<C::Response>,
}

pub(super) async fn execute<C: LiveCluster>(
    ctx: Arc<InvocationContext<C>>,
    cluster: Arc<C>,
    mut inv: Invocation<C>,
    dispatch: Dispatch,
) -> C::Response {
    let policy = inv
        .policy()
        .cluster
        .retry
        .clone()
        .unwrap_or_else(|| default_policy(ctx.config()));
    let retry = RetryContext::new(policy);

    let mut attempt = 0;
    loop {
        let result = invoke_once(&ctx, &cluster, &mut inv, attempt).await;
        attempt = match step(&ctx, &cluster, &retry, &mut inv, result) {
            Step::Done(rsp) => return rsp,
            Step::Retry(attempt) => attempt,
        };

        match dispatch {
            Dispatch::Inline => tokio::time::sleep(retry.policy.interval).await,
            Dispatch::Detached => return detach(ctx, cluster, retry, inv, attempt).await,
        }
    }
}

fn default_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::new(
        DEFAULT_RETRIES,
        config.default_retry_interval,
        config.default_retry_timeout,
    )
}

async fn detach<C: LiveCluster>(
    ctx: Arc<InvocationContext<C>>,
    cluster: Arc<C>,
    retry: RetryContext,
    inv: Invocation<C>,
    attempt: u32,
) -> C::Response {
    let inv = Arc::new(Mutex::new(inv));
    let (completion, rsp) = completion::channel(attempt);
    let interval = retry.policy.interval;
    let detached = Detached {
        ctx: ctx.clone(),
        cluster: cluster.clone(),
        retry,
        inv: inv.clone(),
        completion,
    };
    schedule(Arc::new(detached), attempt, interval);

    match rsp.await {
        Ok(rsp) => rsp,
        Err(abandoned) => {
            // The executor dropped the retry, and with it the invocation lock.
            let inv = inv.lock().await;
            warn!(service = %inv.service(), %abandoned, "Retry abandoned");
            ctx.metrics().retry_outcome(inv.service(), "abandoned");
            cluster.create_response(&inv, abandoned.into())
        }
    }
}

fn schedule<C: LiveCluster>(detached: Arc<Detached<C>>, attempt: u32, delay: Duration) {
    trace!(attempt, ?delay, "Scheduling retry");
    let executor = detached.ctx.executor().clone();
    executor.submit(delay, Box::pin(detached.run(attempt)));
}

/// Classifies an attempt's outcome and either finishes the call with a
/// response or prepares the invocation for the next attempt.
fn step<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    cluster: &C,
    retry: &RetryContext,
    inv: &mut Invocation<C>,
    result: Result<C::Response>,
) -> Step<C::Response> {
    let now = Instant::now();
    let eligible = is_retry_candidate(ctx, &retry.policy, inv, &result);
    let verdict = retry.is_retryable(eligible, now);
    debug!(
        service = %inv.service(),
        attempt = inv.attempt(),
        ?verdict,
        "Classified attempt"
    );

    match verdict {
        Retryable::None => {
            let (outcome, rsp) = match result {
                Ok(rsp) => ("success", rsp),
                Err(error) => ("failed", cluster.create_response(inv, error)),
            };
            ctx.metrics().retry_outcome(inv.service(), outcome);
            Step::Done(rsp)
        }
        Retryable::Exhausted => {
            let error = RetryExhausted {
                attempts: retry.attempts(),
                source: result.err(),
            };
            finish(ctx, cluster, inv, "exhausted", error.into())
        }
        Retryable::Timeout => timeout(ctx, cluster, retry, inv, now, result.err()),
        Retryable::Retry if cluster.is_destroyed() || !ctx.is_ready() => {
            let error = unready(cluster, inv);
            finish(ctx, cluster, inv, "unready", error)
        }
        Retryable::Retry if !retry.fits(now) => timeout(ctx, cluster, retry, inv, now, result.err()),
        Retryable::Retry => {
            let attempt = retry.next_attempt();
            if let Some(error) = result.as_ref().err() {
                debug!(service = %inv.service(), attempt, %error, "Retrying");
            }
            if let Err(error) = cluster.on_retry(inv, attempt) {
                warn!(service = %inv.service(), %error, "Retry hook failed");
            }
            inv.reset_on_retry();
            Step::Retry(attempt)
        }
    }
}

fn timeout<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    cluster: &C,
    retry: &RetryContext,
    inv: &Invocation<C>,
    now: Instant,
    source: Option<Error>,
) -> Step<C::Response> {
    let error = RetryTimeout {
        attempts: retry.attempts(),
        elapsed: now.saturating_duration_since(retry.started),
        source,
    };
    finish(ctx, cluster, inv, "timeout", error.into())
}

fn finish<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    cluster: &C,
    inv: &Invocation<C>,
    outcome: &'static str,
    error: Error,
) -> Step<C::Response> {
    debug!(service = %inv.service(), %error, "Retries ended");
    ctx.metrics().retry_outcome(inv.service(), outcome);
    Step::Done(cluster.create_response(inv, error))
}

/// Returns true if the outcome is a failure that the policy allows retrying.
fn is_retry_candidate<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    policy: &RetryPolicy,
    inv: &Invocation<C>,
    result: &Result<C::Response>,
) -> bool {
    let instances = inv.target().map_or(0, |t| t.original().len());
    if instances == 0 || !policy.is_enabled_for(inv.method()) {
        return false;
    }

    let is_retryable_code =
        |cause: &ErrorCause| cause.code.as_deref().is_some_and(|c| policy.is_retryable_code(c));
    match result {
        Err(error) if is_unretryable(&**error) => false,
        Err(error) => {
            let cause = ctx.parse_error(Some(policy), error);
            is_retryable_code(&cause) || policy.is_retryable_kind(cause.kind.as_deref())
        }
        // A response is a failure only if it says so.
        Ok(rsp) => ctx.parse_response(Some(policy), rsp).is_some_and(|cause| {
            is_retryable_code(&cause)
                || (cause.kind.is_some() && policy.is_retryable_kind(cause.kind.as_deref()))
        }),
    }
}

// === impl RetryContext ===

impl RetryContext {
    pub fn new(policy: RetryPolicy) -> Self {
        let started = Instant::now();
        let deadline = started
            .checked_add(policy.timeout)
            .unwrap_or_else(|| started + Duration::from_secs(86400 * 365 * 30));
        Self {
            policy,
            retries: AtomicU32::new(0),
            started,
            deadline,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The number of retries scheduled so far.
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// The number of attempts made so far, including the first.
    pub fn attempts(&self) -> u32 {
        self.retries() + 1
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Classifies the latest attempt. `eligible` is false when the outcome is
    /// final regardless of budget, e.g. a success or an unretryable error.
    pub fn is_retryable(&self, eligible: bool, now: Instant) -> Retryable {
        if !eligible {
            return Retryable::None;
        }
        let retries = self.retries();
        if retries > 0 && now > self.deadline {
            return Retryable::Timeout;
        }
        if retries >= self.policy.retry {
            return Retryable::Exhausted;
        }
        Retryable::Retry
    }

    /// Returns true if a retry scheduled at `now` would start before the
    /// deadline.
    pub fn fits(&self, now: Instant) -> bool {
        now.checked_add(self.policy.interval)
            .is_some_and(|next| next <= self.deadline)
    }

    /// Claims the next attempt, returning its index.
    fn next_attempt(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }
}

// === impl Detached ===

impl<C: LiveCluster> Detached<C> {
    async fn run(self: Arc<Self>, attempt: u32) {
        let mut inv = self.inv.lock().await;
        self.completion.attempted(attempt);
        let result = invoke_once(&self.ctx, &self.cluster, &mut inv, attempt).await;
        match step(&self.ctx, &self.cluster, &self.retry, &mut inv, result) {
            Step::Done(rsp) => {
                if !self.completion.complete(rsp) {
                    debug!(service = %inv.service(), "Caller went away");
                }
            }
            Step::Retry(attempt) => {
                drop(inv);
                let interval = self.retry.policy.interval;
                schedule(self, attempt, interval);
            }
        }
    }
}
