//! Strategies that drive the attempts of one outbound call.

mod completion;
mod executor;
mod failover;

pub use self::{
    completion::{Completion, ResponseFuture},
    executor::{RetryExecutor, TokioRetryExecutor},
    failover::{Dispatch, RetryContext, Retryable},
};

use crate::{
    cluster::{Invocation, LiveCluster},
    errors::{FaultType, RejectUnready},
    InvocationContext,
};
use livemesh_error::Result;
use livemesh_policy::ClusterStrategy;
use livemesh_route::{Endpoint, RouteTarget};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClusterInvoker {
    Failfast,
    Failover,
    Failsafe,
}

// === impl ClusterInvoker ===

impl From<ClusterStrategy> for ClusterInvoker {
    fn from(strategy: ClusterStrategy) -> Self {
        match strategy {
            ClusterStrategy::Failfast => Self::Failfast,
            ClusterStrategy::Failover => Self::Failover,
            ClusterStrategy::Failsafe => Self::Failsafe,
        }
    }
}

impl ClusterInvoker {
    /// Drives `inv` to completion. Every outcome, including internal
    /// failures, is reported as a response.
    pub async fn execute<C: LiveCluster>(
        self,
        ctx: Arc<InvocationContext<C>>,
        cluster: Arc<C>,
        mut inv: Invocation<C>,
        dispatch: Dispatch,
    ) -> C::Response {
        match self {
            Self::Failfast => match invoke_once(&ctx, &cluster, &mut inv, 0).await {
                Ok(rsp) => rsp,
                Err(error) => {
                    debug!(service = %inv.service(), %error, "Call failed");
                    cluster.create_response(&inv, error)
                }
            },
            Self::Failsafe => match invoke_once(&ctx, &cluster, &mut inv, 0).await {
                Ok(rsp) => rsp,
                Err(error) => {
                    warn!(service = %inv.service(), %error, "Call failed; returning an empty response");
                    cluster.empty_response(&inv)
                }
            },
            Self::Failover => failover::execute(ctx, cluster, inv, dispatch).await,
        }
    }
}

/// Runs one attempt: checks readiness, resolves candidates, and passes the
/// invocation through the filter chain. The cluster's hooks observe the
/// outcome; failures in the hooks are logged and otherwise ignored.
pub(crate) async fn invoke_once<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    cluster: &C,
    inv: &mut Invocation<C>,
    attempt: u32,
) -> Result<C::Response> {
    let result = attempt_once(ctx, cluster, inv, attempt).await;
    match &result {
        Ok(rsp) => {
            if let Err(error) = cluster.on_success(inv, rsp) {
                warn!(service = %inv.service(), %error, "Success hook failed");
            }
        }
        Err(error) => {
            if let Some(fault) = FaultType::of(&**error) {
                ctx.metrics().rejected(inv.service(), fault);
            }
            if let Err(hook) = cluster.on_error(inv, error) {
                warn!(service = %inv.service(), error = %hook, "Error hook failed");
            }
        }
    }
    result
}

async fn attempt_once<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    cluster: &C,
    inv: &mut Invocation<C>,
    attempt: u32,
) -> Result<C::Response> {
    if !ctx.is_ready() {
        if let Some(error) = cluster.create_unready_error(inv) {
            return Err(error);
        }
    }

    // Retries always see a fresh set of candidates.
    if attempt > 0 || !inv.is_routed() {
        let endpoints = cluster.route(inv).await?;
        let version = snapshot_version(&endpoints);
        trace!(endpoints = endpoints.len(), version, "Routed");
        inv.set_target(RouteTarget::with_version(endpoints.into(), version));
    }
    inv.set_attempt(attempt);

    cluster.on_start(inv)?;
    ctx.chain().call(ctx, cluster, inv).await
}

/// Identifies a set of endpoints so that an unchanged set can be recognized
/// cheaply.
fn snapshot_version(endpoints: &[Endpoint]) -> u64 {
    let state = ahash::RandomState::with_seeds(0x6c69, 0x7665, 0x6d65, 0x7368);
    state.hash_one(endpoints.iter().map(|ep| ep.id()).collect::<Vec<_>>())
}

pub(crate) fn unready<C: LiveCluster>(cluster: &C, inv: &Invocation<C>) -> livemesh_error::Error {
    cluster.create_unready_error(inv).unwrap_or_else(|| {
        RejectUnready {
            service: inv.service().clone(),
        }
        .into()
    })
}
