use super::{
    Chain, FilterFuture, OutboundFilter, ORDER_CIRCUIT_BREAKER, ORDER_INSTANCE_CIRCUIT_BREAKER,
};
use crate::{
    cluster::{Invocation, LiveCluster},
    context::InvocationContext,
    errors::{is_local_rejection, CircuitBreak, EndpointRejected, ErrorCause},
};
use livemesh_circuit_breaker::Permit;
use livemesh_error::Result;
use livemesh_policy::{BreakerLevel, RetryPolicy};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Guards the service as a whole. An open breaker completes the call with its
/// degraded response, if one is configured, and rejects it otherwise.
#[derive(Copy, Clone, Debug, Default)]
pub struct CircuitBreakerFilter;

/// Guards the chosen endpoint. An open breaker rejects the endpoint so that
/// the balancer may choose another.
#[derive(Copy, Clone, Debug, Default)]
pub struct InstanceCircuitBreakerFilter;

// === impl CircuitBreakerFilter ===

impl<C: LiveCluster> OutboundFilter<C> for CircuitBreakerFilter {
    fn order(&self) -> i32 {
        ORDER_CIRCUIT_BREAKER
    }

    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        Box::pin(async move {
            let ctx = chain.context();
            let policy = inv.policy().clone();
            let mut permits = Vec::new();
            for cb in policy.breakers(BreakerLevel::Service) {
                let breaker = ctx.breakers().service(cb, inv.service());
                let Some(permit) = breaker.try_acquire() else {
                    // Permits already taken are released as they drop.
                    drop(permits);
                    debug!(policy = cb.id, service = %inv.service(), "Circuit open");
                    if let Some(degrade) = cb.degrade.as_ref() {
                        return Ok(chain.cluster().degrade(inv, degrade));
                    }
                    return Err(CircuitBreak {
                        policy: cb.id,
                        resource: inv.service().clone(),
                    }
                    .into());
                };
                inv.breakers_mut().push_service(breaker);
                permits.push(permit);
            }

            let retry = policy.cluster.retry.as_ref();
            guarded(ctx, retry, permits, chain.proceed(inv)).await
        })
    }
}

// === impl InstanceCircuitBreakerFilter ===

impl<C: LiveCluster> OutboundFilter<C> for InstanceCircuitBreakerFilter {
    fn order(&self) -> i32 {
        ORDER_INSTANCE_CIRCUIT_BREAKER
    }

    fn name(&self) -> &'static str {
        "instance-circuit-breaker"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        Box::pin(async move {
            let Some(endpoint) = inv.endpoint().cloned() else {
                return chain.proceed(inv).await;
            };

            let ctx = chain.context();
            let policy = inv.policy().clone();
            let now = Instant::now();
            let mut permits = Vec::new();
            for cb in policy.breakers(BreakerLevel::Instance) {
                let id = endpoint.id();
                let permit = if ctx.breakers().is_broken(cb.id, id, now) {
                    None
                } else {
                    ctx.breakers()
                        .instance(cb, inv.service(), id)
                        .try_acquire()
                };
                let Some(permit) = permit else {
                    drop(permits);
                    debug!(policy = cb.id, %endpoint, "Instance circuit open");
                    let reason = CircuitBreak {
                        policy: cb.id,
                        resource: id.clone(),
                    };
                    return Err(EndpointRejected::new(id.clone(), reason).into());
                };
                permits.push(permit);
            }
            for permit in &permits {
                inv.breakers_mut().push_instance(permit.breaker().clone());
            }

            let retry = policy.cluster.retry.as_ref();
            guarded(ctx, retry, permits, chain.proceed(inv)).await
        })
    }
}

/// Awaits `call`, reporting its outcome through each of `permits`. If the
/// call is dropped before it completes, the permits are released.
async fn guarded<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    retry: Option<&RetryPolicy>,
    permits: Vec<Permit>,
    call: FilterFuture<'_, C>,
) -> Result<C::Response> {
    if permits.is_empty() {
        return call.await;
    }

    let start = Instant::now();
    let result = call.await;
    record(ctx, retry, permits, &result, start.elapsed());
    result
}

fn record<C: LiveCluster>(
    ctx: &InvocationContext<C>,
    retry: Option<&RetryPolicy>,
    permits: Vec<Permit>,
    result: &Result<C::Response>,
    elapsed: Duration,
) {
    // Outcomes are classified with the retry policy's error parser.
    let rsp = match result {
        Ok(rsp) => rsp,
        Err(error) if is_local_rejection(&**error) => {
            // Never reached the endpoint.
            permits.into_iter().for_each(Permit::release);
            return;
        }
        Err(error) => {
            let ErrorCause { kind, .. } = ctx.parse_error(retry, error);
            for permit in permits {
                permit.error(elapsed, kind.as_deref());
            }
            return;
        }
    };

    match ctx.parse_response(retry, rsp) {
        Some(ErrorCause {
            code: Some(code), ..
        }) => {
            for permit in permits {
                permit.response(elapsed, &code);
            }
        }
        Some(ErrorCause { kind, .. }) => {
            for permit in permits {
                permit.error(elapsed, kind.as_deref());
            }
        }
        None => {
            for permit in permits {
                permit.success(elapsed);
            }
        }
    }
}
