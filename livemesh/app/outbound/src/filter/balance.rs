use super::{Chain, FilterFuture, OutboundFilter, ORDER_LOADBALANCE};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::{EndpointRejected, NoProvider},
    invocation::STICKY_ID,
    OutboundRequest,
};
use livemesh_policy::StickyType;
use tracing::{debug, trace};

/// Chooses the endpoint for an attempt.
///
/// Everything after this filter sees a single candidate. If a later filter
/// rejects that endpoint, it is removed from the pool and another is chosen,
/// up to the configured number of reselections.
#[derive(Copy, Clone, Debug, Default)]
pub struct LoadBalanceFilter;

impl<C: LiveCluster> OutboundFilter<C> for LoadBalanceFilter {
    fn order(&self) -> i32 {
        ORDER_LOADBALANCE
    }

    fn name(&self) -> &'static str {
        "load-balance"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        Box::pin(async move {
            let ctx = chain.context();
            let policy = inv.policy().clone();
            let service = inv.service().clone();
            let counters = ctx.counters().service(&service);
            let sticky = policy.load_balance.sticky == StickyType::Preferred;

            let mut reselects = 0;
            loop {
                inv.breakers_mut().clear();
                let candidates = inv.endpoints().to_vec();
                let sticky_id = inv.sticky_id().filter(|_| sticky).cloned();

                let chosen = inv.target_mut().and_then(|target| {
                    target.choose(|endpoints| {
                        let preferred = sticky_id
                            .as_ref()
                            .and_then(|id| endpoints.iter().position(|ep| ep.id() == id));
                        preferred.or_else(|| {
                            ctx.balancers().choose(
                                policy.load_balance.balance,
                                &service,
                                endpoints,
                                &counters,
                            )
                        })
                    })
                });
                let Some(chosen) = chosen else {
                    return Err(NoProvider { service }.into());
                };
                trace!(endpoint = %chosen, candidates = candidates.len(), "Selected");

                if sticky {
                    inv.set_sticky_id(chosen.id().clone());
                    inv.request_mut().set_attribute(STICKY_ID, chosen.id());
                }
                inv.select(chosen.clone(), candidates);

                let error = match chain.proceed(inv).await {
                    Err(error) if error.is::<EndpointRejected>() => error,
                    result => return result,
                };

                let mut remaining = inv
                    .take_selection()
                    .map(|s| s.candidates)
                    .unwrap_or_default();
                remaining.retain(|ep| *ep != chosen);
                if remaining.is_empty() || reselects >= ctx.config().max_reselects {
                    debug!(endpoint = %chosen, reselects, "Endpoint rejected");
                    return Err(EndpointRejected::into_reason(error));
                }

                reselects += 1;
                debug!(endpoint = %chosen, %error, reselects, "Endpoint rejected; reselecting");
                if let Some(target) = inv.target_mut() {
                    target.reset_to(remaining);
                }
            }
        })
    }
}
