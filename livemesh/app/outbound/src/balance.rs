//! Endpoint selection strategies.

use ahash::AHashMap;
use livemesh_counter::ServiceCounter;
use livemesh_policy::LoadBalance;
use livemesh_route::Endpoint;
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Arc;

/// Chooses one endpoint among candidates according to a [`LoadBalance`]
/// strategy. Round-robin cursors are kept per service.
#[derive(Debug)]
pub struct Balancers {
    cursors: Mutex<AHashMap<Arc<str>, usize>>,
    rng: Mutex<SmallRng>,
}

// === impl Balancers ===

impl Default for Balancers {
    fn default() -> Self {
        Self::with_rng(SmallRng::from_rng(&mut rand::rng()))
    }
}

impl Balancers {
    pub fn with_rng(rng: SmallRng) -> Self {
        Self {
            cursors: Mutex::new(AHashMap::default()),
            rng: Mutex::new(rng),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    /// Returns the index of the chosen endpoint.
    pub fn choose(
        &self,
        balance: LoadBalance,
        service: &Arc<str>,
        endpoints: &[Endpoint],
        counters: &ServiceCounter,
    ) -> Option<usize> {
        match endpoints.len() {
            0 => return None,
            1 => return Some(0),
            _ => {}
        }

        match balance {
            LoadBalance::Random => Some(self.rng.lock().random_range(0..endpoints.len())),
            LoadBalance::RoundRobin => Some(self.round_robin(service, endpoints.len())),
            LoadBalance::WeightedRandom => Some(self.weighted(endpoints)),
            LoadBalance::LeastActive => Some(self.least_active(endpoints, counters)),
        }
    }

    fn round_robin(&self, service: &Arc<str>, len: usize) -> usize {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(service.clone()).or_insert(0);
        let idx = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        idx
    }

    fn weighted(&self, endpoints: &[Endpoint]) -> usize {
        let total = endpoints.iter().map(|ep| u64::from(ep.weight())).sum::<u64>();
        let mut rng = self.rng.lock();
        if total == 0 {
            return rng.random_range(0..endpoints.len());
        }

        let mut point = rng.random_range(0..total);
        for (idx, ep) in endpoints.iter().enumerate() {
            let weight = u64::from(ep.weight());
            if point < weight {
                return idx;
            }
            point -= weight;
        }
        endpoints.len() - 1
    }

    fn least_active(&self, endpoints: &[Endpoint], counters: &ServiceCounter) -> usize {
        let active = endpoints
            .iter()
            .map(|ep| counters.get(ep).map_or(0, |c| c.active()))
            .collect::<Vec<_>>();
        let min = active.iter().copied().min().unwrap_or(0);
        let ties = active
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == min)
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        match ties.as_slice() {
            [idx] => *idx,
            _ => ties[self.rng.lock().random_range(0..ties.len())],
        }
    }
}
