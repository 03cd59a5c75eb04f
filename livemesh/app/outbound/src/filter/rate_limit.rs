use super::{Chain, FilterFuture, OutboundFilter, ORDER_RATE_LIMITER};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::RejectLimit,
};

/// Applies the service's rate limits, waiting briefly for a permit when the
/// policy allows it. Each attempt takes its permits once, however many
/// endpoints the balancer tries.
#[derive(Copy, Clone, Debug, Default)]
pub struct RateLimitFilter;

impl<C: LiveCluster> OutboundFilter<C> for RateLimitFilter {
    fn order(&self) -> i32 {
        ORDER_RATE_LIMITER
    }

    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        Box::pin(async move {
            if inv.is_rate_limited() {
                return chain.proceed(inv).await;
            }

            let policy = inv.policy().clone();
            for rate_limit in &policy.rate_limits {
                let Some(limiter) = chain.context().limiters().get(rate_limit) else {
                    continue;
                };
                if let Err(limited) = limiter.acquire().await {
                    tracing::debug!(service = %inv.service(), %limited, "Rate limited");
                    return Err(RejectLimit::from(limited).into());
                }
            }
            inv.set_rate_limited();
            chain.proceed(inv).await
        })
    }
}
