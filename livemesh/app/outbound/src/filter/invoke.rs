use super::{Chain, FilterFuture, OutboundFilter, ORDER_INVOKE};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::NoProvider,
};

/// Terminates the chain by calling the chosen endpoint.
#[derive(Copy, Clone, Debug, Default)]
pub struct InvokeFilter;

impl<C: LiveCluster> OutboundFilter<C> for InvokeFilter {
    fn order(&self) -> i32 {
        ORDER_INVOKE
    }

    fn name(&self) -> &'static str {
        "invoke"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        // Without a balancer in the chain, a lone candidate is the endpoint.
        let endpoint = inv
            .endpoint()
            .or_else(|| inv.target().and_then(|t| t.single()))
            .cloned();
        let Some(endpoint) = endpoint else {
            let error = NoProvider {
                service: inv.service().clone(),
            };
            return Box::pin(futures::future::ready(Err(error.into())));
        };

        tracing::trace!(%endpoint, attempt = inv.attempt(), "Invoking endpoint");
        chain.context().metrics().attempt(inv.service());
        chain.cluster().invoke(inv, &endpoint)
    }
}
