use super::{Chain, FilterFuture, OutboundFilter, ORDER_FAULT_INJECTION};
use crate::{
    cluster::{Invocation, LiveCluster},
    errors::FaultInjected,
};
use livemesh_policy::Fault;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::debug;

/// Delays or aborts a configured share of calls.
#[derive(Debug)]
pub struct FaultInjectionFilter {
    rng: Mutex<SmallRng>,
}

// === impl FaultInjectionFilter ===

impl Default for FaultInjectionFilter {
    fn default() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_rng(&mut rand::rng())),
        }
    }
}

impl FaultInjectionFilter {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    fn hit(&self, percent: f64) -> bool {
        if percent >= 100.0 {
            return true;
        }
        if percent <= 0.0 {
            return false;
        }
        self.rng.lock().random::<f64>() * 100.0 < percent
    }
}

impl<C: LiveCluster> OutboundFilter<C> for FaultInjectionFilter {
    fn order(&self) -> i32 {
        ORDER_FAULT_INJECTION
    }

    fn name(&self) -> &'static str {
        "fault-injection"
    }

    fn filter<'a>(&'a self, inv: &'a mut Invocation<C>, chain: Chain<'a, C>) -> FilterFuture<'a, C> {
        Box::pin(async move {
            let policy = inv.policy().clone();
            for fi in &policy.fault_injections {
                if !fi.applies_to(inv.lane()) || !self.hit(fi.percent) {
                    continue;
                }
                match &fi.fault {
                    Fault::Delay(delay) => {
                        debug!(policy = fi.id, ?delay, "Injecting delay");
                        tokio::time::sleep(*delay).await;
                    }
                    Fault::Abort { code, message } => {
                        debug!(policy = fi.id, %code, "Injecting abort");
                        return Err(FaultInjected {
                            policy: fi.id,
                            code: code.clone(),
                            message: message.clone(),
                        }
                        .into());
                    }
                }
            }
            chain.proceed(inv).await
        })
    }
}
