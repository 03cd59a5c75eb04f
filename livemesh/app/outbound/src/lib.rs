//! Governs outbound calls.
//!
//! Each call is described by an [`OutboundInvocation`] and carried out by an
//! [`InvocationContext`] against a [`LiveCluster`]. The service's policy
//! selects a [`ClusterInvoker`] strategy; every attempt the strategy makes is
//! passed through the [`filter`] chain, which narrows the candidate endpoints,
//! chooses one, applies rate limits, circuit breakers and concurrency limits,
//! and finally invokes the endpoint. Whatever happens, the caller receives
//! exactly one response.

#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

pub mod balance;
mod cluster;
mod context;
pub mod env;
pub mod errors;
pub mod filter;
mod invocation;
pub mod invoker;
pub mod metrics;
#[cfg(test)]
pub(crate) mod test_util;

pub use self::{
    cluster::{AppStatus, Invocation, LiveCluster, Readiness},
    context::{Builder, InvocationContext},
    invocation::{
        Breakers, OutboundInvocation, OutboundRequest, OutboundResponse, Selection,
        AUTH_REQUIRED, STICKY_ID,
    },
    invoker::{ClusterInvoker, Dispatch, RetryContext, Retryable},
};
pub use livemesh_error::{Error, Result};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Threads dedicated to detached retries. When zero, retries run on the
    /// runtime that built the context.
    pub retry_threads: usize,

    /// Retry timing for failover calls whose service has no retry policy.
    pub default_retry_interval: Duration,
    pub default_retry_timeout: Duration,

    /// The minimum time between sweeps of stale endpoint counters.
    pub counter_clean_interval: Duration,

    /// How many times the balancer may choose another endpoint after a
    /// chosen endpoint is rejected within one attempt.
    pub max_reselects: usize,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_threads: 0,
            default_retry_interval: Duration::from_millis(100),
            default_retry_timeout: Duration::from_secs(5),
            counter_clean_interval: Duration::from_secs(60),
            max_reselects: 3,
        }
    }
}
