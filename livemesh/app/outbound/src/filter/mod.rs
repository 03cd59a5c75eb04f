//! The ordered pipeline of policies applied to each attempt.
//!
//! Filters run in ascending [`OutboundFilter::order`]. Each filter either
//! continues the call with [`Chain::proceed`] or completes it early by
//! rejecting it or returning a substitute response. The load-balance filter
//! wraps everything after it: when a later filter refuses the chosen endpoint
//! with an [`EndpointRejected`](crate::errors::EndpointRejected) error, the
//! balancer drops that endpoint and chooses again.

mod auth;
mod balance;
mod breaker;
mod counter;
mod fault;
mod health;
mod invoke;
mod lane;
mod rate_limit;
mod tag_route;

pub use self::{
    auth::AuthFilter,
    balance::LoadBalanceFilter,
    breaker::{CircuitBreakerFilter, InstanceCircuitBreakerFilter},
    counter::CounterFilter,
    fault::FaultInjectionFilter,
    health::HealthFilter,
    invoke::InvokeFilter,
    lane::LaneFilter,
    rate_limit::RateLimitFilter,
    tag_route::TagRouteFilter,
};

use crate::{
    cluster::{Invocation, LiveCluster},
    InvocationContext,
};
use futures::future::{self, BoxFuture};
use livemesh_error::{Error, Result};
use std::{fmt, sync::Arc};
use thiserror::Error;

pub const ORDER_AUTH: i32 = 100;
pub const ORDER_FAULT_INJECTION: i32 = 200;
pub const ORDER_HEALTH: i32 = 300;
pub const ORDER_LANE: i32 = 400;
pub const ORDER_LOADBALANCE: i32 = 500;
pub const ORDER_RATE_LIMITER: i32 = 600;
pub const ORDER_TAG_ROUTE: i32 = 700;
pub const ORDER_CIRCUIT_BREAKER: i32 = 800;
pub const ORDER_INSTANCE_CIRCUIT_BREAKER: i32 = 900;
pub const ORDER_COUNTER: i32 = 1000;
pub const ORDER_INVOKE: i32 = 1100;

pub type FilterFuture<'a, C> = BoxFuture<'a, Result<<C as LiveCluster>::Response>>;

/// A policy applied to each attempt of an outbound call.
pub trait OutboundFilter<C: LiveCluster>: Send + Sync + 'static {
    fn order(&self) -> i32;

    fn name(&self) -> &'static str;

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C>;
}

/// The filters of a context, sorted by order.
pub struct FilterChain<C: LiveCluster> {
    filters: Arc<[Arc<dyn OutboundFilter<C>>]>,
}

/// The remainder of a filter chain.
pub struct Chain<'a, C: LiveCluster> {
    ctx: &'a InvocationContext<C>,
    cluster: &'a C,
    rest: &'a [Arc<dyn OutboundFilter<C>>],
}

#[derive(Debug, Error)]
#[error("filter chain ended without invoking an endpoint")]
pub struct Unterminated(());

/// The standard filter set.
pub fn defaults<C: LiveCluster>() -> Vec<Arc<dyn OutboundFilter<C>>> {
    vec![
        Arc::new(AuthFilter),
        Arc::new(FaultInjectionFilter::default()),
        Arc::new(HealthFilter),
        Arc::new(LaneFilter),
        Arc::new(LoadBalanceFilter),
        Arc::new(RateLimitFilter),
        Arc::new(TagRouteFilter),
        Arc::new(CircuitBreakerFilter),
        Arc::new(InstanceCircuitBreakerFilter),
        Arc::new(CounterFilter),
        Arc::new(InvokeFilter),
    ]
}

// === impl FilterChain ===

impl<C: LiveCluster> FilterChain<C> {
    pub fn new(mut filters: Vec<Arc<dyn OutboundFilter<C>>>) -> Self {
        // Stable, so filters that share an order keep their given order.
        filters.sort_by_key(|f| f.order());
        Self {
            filters: filters.into(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.filters.iter().map(|f| f.name())
    }

    pub(crate) fn call<'a>(
        &'a self,
        ctx: &'a InvocationContext<C>,
        cluster: &'a C,
        inv: &'a mut Invocation<C>,
    ) -> FilterFuture<'a, C> {
        Chain {
            ctx,
            cluster,
            rest: &self.filters,
        }
        .proceed(inv)
    }
}

impl<C: LiveCluster> fmt::Debug for FilterChain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// === impl Chain ===

impl<'a, C: LiveCluster> Chain<'a, C> {
    pub fn context(&self) -> &'a InvocationContext<C> {
        self.ctx
    }

    pub fn cluster(&self) -> &'a C {
        self.cluster
    }

    /// Passes the invocation to the next filter.
    pub fn proceed<'b>(self, inv: &'b mut Invocation<C>) -> FilterFuture<'b, C>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((filter, rest)) => {
                tracing::trace!(filter = filter.name(), "Filtering");
                filter.filter(inv, Chain { rest, ..self })
            }
            None => Box::pin(future::ready(Err(Error::from(Unterminated(()))))),
        }
    }
}

impl<C: LiveCluster> Clone for Chain<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: LiveCluster> Copy for Chain<'_, C> {}
