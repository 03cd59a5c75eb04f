use super::{Chain, FilterFuture, OutboundFilter, ORDER_AUTH};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::RejectAuth,
    invocation::AUTH_REQUIRED,
    OutboundRequest,
};
use futures::future;
use livemesh_policy::AuthPolicy;

/// Attaches the service's credentials to the request.
///
/// A request that demands credentials is rejected when the service has no
/// auth policy.
#[derive(Copy, Clone, Debug, Default)]
pub struct AuthFilter;

impl<C: LiveCluster> OutboundFilter<C> for AuthFilter {
    fn order(&self) -> i32 {
        ORDER_AUTH
    }

    fn name(&self) -> &'static str {
        "auth"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        let policy = inv.policy().clone();
        match &policy.auth {
            Some(AuthPolicy::Token { key, value }) => {
                tracing::trace!(%key, "Attaching token");
                inv.request_mut().set_attribute(key, value);
            }
            None if inv.request().attribute(AUTH_REQUIRED) == Some("true") => {
                let error = RejectAuth {
                    service: inv.service().clone(),
                };
                return Box::pin(future::ready(Err(error.into())));
            }
            None => {}
        }
        chain.proceed(inv)
    }
}
