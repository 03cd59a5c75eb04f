use super::{Chain, FilterFuture, OutboundFilter, ORDER_COUNTER};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::RejectLimit,
};

/// Tracks active calls per endpoint, enforcing the service's concurrency
/// limit.
#[derive(Copy, Clone, Debug, Default)]
pub struct CounterFilter;

impl<C: LiveCluster> OutboundFilter<C> for CounterFilter {
    fn order(&self) -> i32 {
        ORDER_COUNTER
    }

    fn name(&self) -> &'static str {
        "counter"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        Box::pin(async move {
            let Some(endpoint) = inv.endpoint().cloned() else {
                return chain.proceed(inv).await;
            };

            let counters = chain.context().counters().service(inv.service());
            if let Some(target) = inv.target() {
                counters.try_clean(target.version(), target.original());
            }

            let max_active = inv.policy().concurrency.map(|c| c.max_active);
            let Some(permit) = counters.counter(&endpoint).begin(max_active) else {
                tracing::debug!(%endpoint, ?max_active, "Concurrency limit reached");
                return Err(RejectLimit::Concurrency {
                    endpoint: endpoint.id().clone(),
                    max_active: max_active.unwrap_or_default(),
                }
                .into());
            };

            let result = chain.proceed(inv).await;
            let elapsed = permit.started().elapsed();
            match result {
                Ok(_) => permit.success(elapsed),
                Err(_) => permit.fail(elapsed),
            }
            result
        })
    }
}
