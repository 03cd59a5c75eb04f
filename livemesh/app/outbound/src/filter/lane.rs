use super::{Chain, FilterFuture, OutboundFilter, ORDER_LANE};
use crate::cluster::{Invocation, LiveCluster};
use tracing::trace;

/// Prefers endpoints on the request's lane, then endpoints on the base lane,
/// then any endpoint.
#[derive(Copy, Clone, Debug, Default)]
pub struct LaneFilter;

impl<C: LiveCluster> OutboundFilter<C> for LaneFilter {
    fn order(&self) -> i32 {
        ORDER_LANE
    }

    fn name(&self) -> &'static str {
        "lane"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        let lane = inv.lane().map(str::to_owned);
        if let Some(target) = inv.target_mut() {
            let on_lane = match lane.as_deref() {
                Some(lane) => target.filter(|ep| ep.lane() == Some(lane), None, true),
                None => 0,
            };
            if on_lane == 0 {
                let base = target.filter(|ep| ep.lane().is_none(), None, true);
                trace!(lane = ?lane, base, "Falling back from lane");
            }
        }
        chain.proceed(inv)
    }
}
