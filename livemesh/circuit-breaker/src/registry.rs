use crate::{CircuitBreaker, State, StateListener, Transition};
use ahash::AHashMap;
use livemesh_policy::CircuitBreakPolicy;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::time::Instant;
use tracing::debug;

/// Caches breakers by policy and resource.
///
/// A breaker is rebuilt, with fresh state, when the version of its policy
/// changes.
pub struct BreakerRegistry {
    breakers: Mutex<AHashMap<Key, Arc<CircuitBreaker>>>,
    broken: Arc<BrokenInstances>,
    listeners: Vec<Arc<dyn StateListener>>,
}

/// Tracks endpoints whose instance-level breakers are open.
#[derive(Debug, Default)]
pub struct BrokenInstances {
    until: Mutex<AHashMap<(u64, Arc<str>), Instant>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Key {
    policy: u64,
    service: Arc<str>,
    instance: Option<Arc<str>>,
}

// === impl BreakerRegistry ===

impl BreakerRegistry {
    pub fn new(listeners: Vec<Arc<dyn StateListener>>) -> Self {
        Self {
            breakers: Mutex::new(AHashMap::default()),
            broken: Arc::new(BrokenInstances::default()),
            listeners,
        }
    }

    /// Returns the breaker guarding all calls to `service`.
    pub fn service(&self, policy: &CircuitBreakPolicy, service: &str) -> Arc<CircuitBreaker> {
        self.get(policy, service, None)
    }

    /// Returns the breaker guarding calls to one endpoint of `service`.
    pub fn instance(
        &self,
        policy: &CircuitBreakPolicy,
        service: &str,
        endpoint: &Arc<str>,
    ) -> Arc<CircuitBreaker> {
        self.get(policy, service, Some(endpoint.clone()))
    }

    /// Returns true if `endpoint`'s breaker for `policy_id` is open at `now`.
    pub fn is_broken(&self, policy_id: u64, endpoint: &str, now: Instant) -> bool {
        self.broken.is_broken(policy_id, endpoint, now)
    }

    pub fn broken(&self) -> &Arc<BrokenInstances> {
        &self.broken
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.lock().is_empty()
    }

    fn get(
        &self,
        policy: &CircuitBreakPolicy,
        service: &str,
        instance: Option<Arc<str>>,
    ) -> Arc<CircuitBreaker> {
        let key = Key {
            policy: policy.id,
            service: service.into(),
            instance,
        };

        let mut breakers = self.breakers.lock();
        if let Some(breaker) = breakers.get(&key) {
            if breaker.policy().version == policy.version {
                return breaker.clone();
            }
            debug!(policy = policy.id, version = policy.version, %service, "Rebuilding breaker");
            if let Some(instance) = key.instance.as_ref() {
                self.broken.remove(policy.id, instance);
            }
        }

        let mut listeners = Vec::with_capacity(self.listeners.len() + 1);
        if key.instance.is_some() {
            listeners.push(self.broken.clone() as Arc<dyn StateListener>);
        }
        listeners.extend(self.listeners.iter().cloned());

        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(policy.clone()),
            key.service.clone(),
            key.instance.clone(),
            listeners,
        ));
        breakers.insert(key, breaker.clone());
        breaker
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.len())
            .field("broken", &self.broken)
            .finish()
    }
}

// === impl BrokenInstances ===

impl BrokenInstances {
    pub fn is_broken(&self, policy_id: u64, endpoint: &str, now: Instant) -> bool {
        let until = self.until.lock();
        until
            .get(&(policy_id, Arc::from(endpoint)))
            .is_some_and(|until| now < *until)
    }

    fn remove(&self, policy_id: u64, endpoint: &Arc<str>) {
        self.until.lock().remove(&(policy_id, endpoint.clone()));
    }
}

impl StateListener for BrokenInstances {
    fn on_transition(&self, t: &Transition<'_>) {
        let Some(instance) = t.instance else {
            return;
        };
        let key = (t.policy_id, Arc::<str>::from(instance));
        match (t.to, t.until) {
            (State::Open, Some(until)) => {
                self.until.lock().insert(key, until);
            }
            _ => {
                self.until.lock().remove(&key);
            }
        }
    }
}
