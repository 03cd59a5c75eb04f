use super::{Chain, FilterFuture, OutboundFilter, ORDER_HEALTH};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::NoProvider,
};
use futures::future;

/// Drops candidates that are not accepting traffic.
#[derive(Copy, Clone, Debug, Default)]
pub struct HealthFilter;

impl<C: LiveCluster> OutboundFilter<C> for HealthFilter {
    fn order(&self) -> i32 {
        ORDER_HEALTH
    }

    fn name(&self) -> &'static str {
        "health"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        let healthy = match inv.target_mut() {
            Some(target) => target.filter(|ep| ep.is_accessible(), None, false),
            None => 0,
        };
        if healthy == 0 {
            tracing::debug!(service = %inv.service(), "No accessible endpoints");
            let error = NoProvider {
                service: inv.service().clone(),
            };
            return Box::pin(future::ready(Err(error.into())));
        }
        chain.proceed(inv)
    }
}
