use crate::Counter;
use ahash::AHashMap;
use livemesh_route::Endpoint;
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// The process-wide set of counters, grouped by service.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    services: RwLock<AHashMap<Arc<str>, Arc<ServiceCounter>>>,
    clean_interval: Duration,
}

/// The counters for the endpoints of a single service.
///
/// Counters are created lazily as endpoints receive calls. To keep the map
/// from growing as endpoints churn, each counter records the generation in
/// which it was last part of a discovery snapshot; counters that fall behind
/// are evicted when a new snapshot is observed.
#[derive(Debug)]
pub struct ServiceCounter {
    name: Arc<str>,
    counters: RwLock<AHashMap<Arc<str>, Arc<Counter>>>,
    generation: AtomicU64,
    clean: Mutex<Clean>,
    clean_interval: Duration,
}

#[derive(Debug, Default)]
struct Clean {
    version: Option<u64>,
    last: Option<Instant>,
}

// === impl CounterRegistry ===

impl CounterRegistry {
    /// Creates a registry that sweeps each service at most once per
    /// `clean_interval`.
    pub fn new(clean_interval: Duration) -> Self {
        Self {
            services: Default::default(),
            clean_interval,
        }
    }

    pub fn service(&self, name: &str) -> Arc<ServiceCounter> {
        if let Some(svc) = self.services.read().get(name) {
            return svc.clone();
        }

        let mut services = self.services.write();
        services
            .entry(Arc::from(name))
            .or_insert_with(|| Arc::new(ServiceCounter::new(name.into(), self.clean_interval)))
            .clone()
    }

    pub fn counter(&self, service: &str, endpoint: &Endpoint) -> Arc<Counter> {
        self.service(service).counter(endpoint)
    }
}

// === impl ServiceCounter ===

impl ServiceCounter {
    fn new(name: Arc<str>, clean_interval: Duration) -> Self {
        Self {
            name,
            counters: Default::default(),
            generation: AtomicU64::new(0),
            clean: Default::default(),
            clean_interval,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<Counter>> {
        self.counters.read().get(endpoint.id()).cloned()
    }

    pub fn counter(&self, endpoint: &Endpoint) -> Arc<Counter> {
        if let Some(counter) = self.get(endpoint) {
            return counter;
        }

        let mut counters = self.counters.write();
        counters
            .entry(endpoint.id().clone())
            .or_insert_with(|| {
                let generation = self.generation.load(Ordering::Acquire);
                Arc::new(Counter::new(endpoint.id().clone(), generation))
            })
            .clone()
    }

    /// Evicts counters for endpoints that are not part of the discovery
    /// snapshot identified by `version`.
    ///
    /// This is a no-op when `version` has already been swept or when the
    /// previous sweep happened less than the clean interval ago. Returns the
    /// number of evicted counters.
    pub fn try_clean(&self, version: u64, endpoints: &[Endpoint]) -> usize {
        let mut clean = self.clean.lock();
        if clean.version == Some(version) {
            return 0;
        }
        let now = Instant::now();
        if let Some(last) = clean.last {
            if now.saturating_duration_since(last) < self.clean_interval {
                return 0;
            }
        }
        clean.version = Some(version);
        clean.last = Some(now);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let counters = self.counters.read();
            for ep in endpoints {
                if let Some(counter) = counters.get(ep.id()) {
                    counter.last_seen.store(generation, Ordering::Release);
                }
            }
        }

        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|_, c| c.last_seen.load(Ordering::Acquire) >= generation);
        let evicted = before - counters.len();
        if evicted > 0 {
            debug!(service = %self.name, evicted, version, "Evicted stale counters");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str, n: u8) -> Endpoint {
        Endpoint::builder(id, ([10, 0, 0, n], 80).into()).build()
    }

    #[test]
    fn counters_are_shared_per_endpoint() {
        let registry = CounterRegistry::default();
        let a = ep("a", 1);
        let c0 = registry.counter("svc", &a);
        let c1 = registry.counter("svc", &a);
        assert!(Arc::ptr_eq(&c0, &c1));

        let other = registry.counter("other", &a);
        assert!(!Arc::ptr_eq(&c0, &other));
    }

    #[test]
    fn clean_evicts_departed_endpoints() {
        let registry = CounterRegistry::default();
        let svc = registry.service("svc");
        let (a, b, c) = (ep("a", 1), ep("b", 2), ep("c", 3));
        svc.counter(&a);
        svc.counter(&b);
        svc.counter(&c);

        assert_eq!(svc.try_clean(1, &[a.clone(), c.clone()]), 1);
        assert_eq!(svc.len(), 2);
        assert!(svc.get(&b).is_none());

        // The same snapshot is not swept twice.
        assert_eq!(svc.try_clean(1, &[]), 0);
        assert_eq!(svc.len(), 2);

        assert_eq!(svc.try_clean(2, &[c.clone()]), 1);
        assert!(svc.get(&a).is_none());
        assert!(svc.get(&c).is_some());
    }

    #[test]
    fn in_flight_permits_survive_eviction() {
        let registry = CounterRegistry::default();
        let svc = registry.service("svc");
        let a = ep("a", 1);
        let counter = svc.counter(&a);
        let permit = counter.begin(None).expect("admitted");
        svc.try_clean(7, &[]);
        assert!(svc.is_empty());

        permit.success(Duration::from_millis(1));
        let snap = counter.snapshot();
        assert_eq!(snap.active, 0);
        assert_eq!(snap.succeeded, 1);
        assert!(!Arc::ptr_eq(&counter, &svc.counter(&a)));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn clean_interval_throttles_sweeps() {
        let registry = CounterRegistry::new(Duration::from_secs(10));
        let svc = registry.service("svc");
        let (a, b) = (ep("a", 1), ep("b", 2));
        svc.counter(&a);
        svc.counter(&b);

        assert_eq!(svc.try_clean(1, &[a.clone(), b.clone()]), 0);
        assert_eq!(svc.try_clean(2, &[a.clone()]), 0);
        assert_eq!(svc.len(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(svc.try_clean(2, &[a.clone()]), 1);
        assert_eq!(svc.len(), 1);
    }
}
