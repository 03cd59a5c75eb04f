use super::{Chain, FilterFuture, OutboundFilter, ORDER_TAG_ROUTE};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::{EndpointRejected, TagMismatch},
    OutboundRequest,
};
use tracing::trace;

/// Enforces the first tag route whose conditions match the request.
///
/// The chosen endpoint is rejected when it lies outside the route's
/// destination and some other candidate does not. Candidates outside the
/// destination are dropped from the pool first so the balancer's next choice
/// satisfies the route.
#[derive(Copy, Clone, Debug, Default)]
pub struct TagRouteFilter;

impl<C: LiveCluster> OutboundFilter<C> for TagRouteFilter {
    fn order(&self) -> i32 {
        ORDER_TAG_ROUTE
    }

    fn name(&self) -> &'static str {
        "tag-route"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        let policy = inv.policy().clone();
        let route = {
            let request = inv.request();
            policy
                .tag_routes
                .iter()
                .find(|route| route.matches_request(|key: &str| request.attribute(key)))
        };
        let (Some(route), Some(endpoint)) = (route, inv.endpoint().cloned()) else {
            return chain.proceed(inv);
        };
        if route.selects(&endpoint) {
            return chain.proceed(inv);
        }

        let satisfiable = inv
            .selection()
            .is_some_and(|s| s.candidates.iter().any(|ep| route.selects(ep)));
        if !satisfiable {
            trace!(route = route.id, "No candidate satisfies route");
            return chain.proceed(inv);
        }

        inv.retain_candidates(|ep| route.selects(ep));
        let error = EndpointRejected::new(endpoint.id().clone(), TagMismatch { route: route.id });
        Box::pin(futures::future::ready(Err(error.into())))
    }
}
