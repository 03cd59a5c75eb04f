#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

pub mod breaker;
pub mod cluster;
pub mod fault;
pub mod limit;
pub mod route;
mod supplier;

pub use self::{
    breaker::{BreakerLevel, CircuitBreakPolicy, DegradeConfig, SlidingWindow},
    cluster::{ClusterPolicy, ClusterStrategy, RetryPolicy},
    fault::{AuthPolicy, Fault, FaultInjectionPolicy},
    limit::{ConcurrencyLimitPolicy, RateLimitPolicy},
    route::{LoadBalance, LoadBalancePolicy, StickyType, TagCondition, TagOp, TagRoute},
    supplier::{PolicySupplier, Updater, WatchPolicySupplier},
};

use ahash::AHashMap;
use std::sync::Arc;

/// The complete set of service policies at a point in time.
#[derive(Clone, Debug, Default)]
pub struct GovernancePolicy {
    version: u64,
    services: AHashMap<String, Arc<ServicePolicy>>,
}

/// The governance configuration for calls to one service.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServicePolicy {
    pub name: String,
    pub cluster: ClusterPolicy,
    pub load_balance: LoadBalancePolicy,
    pub concurrency: Option<ConcurrencyLimitPolicy>,
    pub rate_limits: Vec<RateLimitPolicy>,
    pub circuit_breakers: Vec<CircuitBreakPolicy>,
    pub fault_injections: Vec<FaultInjectionPolicy>,
    pub auth: Option<AuthPolicy>,
    pub tag_routes: Vec<TagRoute>,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidPolicy {
    #[error("service {service}: invalid circuit breaker {id}: {reason}")]
    CircuitBreaker {
        service: String,
        id: u64,
        reason: &'static str,
    },

    #[error("service {service}: invalid rate limit {id}: {reason}")]
    RateLimit {
        service: String,
        id: u64,
        reason: &'static str,
    },

    #[error("service {service}: invalid fault injection {id}: percent must be within 0..=100")]
    FaultPercent { service: String, id: u64 },

    #[error("service {service}: concurrency limit must be non-zero")]
    Concurrency { service: String },
}

// === impl GovernancePolicy ===

impl GovernancePolicy {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            services: AHashMap::default(),
        }
    }

    pub fn with_service(mut self, policy: ServicePolicy) -> Self {
        self.services.insert(policy.name.clone(), Arc::new(policy));
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn service(&self, name: &str) -> Option<&Arc<ServicePolicy>> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<ServicePolicy>> {
        self.services.values()
    }

    pub fn validate(&self) -> Result<(), InvalidPolicy> {
        self.services.values().try_for_each(|svc| svc.validate())
    }
}

// === impl ServicePolicy ===

impl ServicePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), InvalidPolicy> {
        for cb in &self.circuit_breakers {
            cb.validate().map_err(|reason| InvalidPolicy::CircuitBreaker {
                service: self.name.clone(),
                id: cb.id,
                reason,
            })?;
        }

        for rl in &self.rate_limits {
            rl.validate().map_err(|reason| InvalidPolicy::RateLimit {
                service: self.name.clone(),
                id: rl.id,
                reason,
            })?;
        }

        for fi in &self.fault_injections {
            if !(0.0..=100.0).contains(&fi.percent) {
                return Err(InvalidPolicy::FaultPercent {
                    service: self.name.clone(),
                    id: fi.id,
                });
            }
        }

        if matches!(self.concurrency, Some(ConcurrencyLimitPolicy { max_active: 0 })) {
            return Err(InvalidPolicy::Concurrency {
                service: self.name.clone(),
            });
        }

        Ok(())
    }

    pub fn breakers(&self, level: BreakerLevel) -> impl Iterator<Item = &CircuitBreakPolicy> {
        self.circuit_breakers
            .iter()
            .filter(move |cb| cb.level == level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn validation_rejects_bad_breakers() {
        let mut svc = ServicePolicy::new("orders");
        svc.circuit_breakers.push(CircuitBreakPolicy {
            failure_rate_threshold: 120.0,
            ..CircuitBreakPolicy::new(7)
        });
        let err = GovernancePolicy::new(1)
            .with_service(svc)
            .validate()
            .expect_err("threshold out of range");
        assert!(matches!(err, InvalidPolicy::CircuitBreaker { id: 7, .. }));
    }

    #[test]
    fn validation_rejects_bad_limits() {
        let mut svc = ServicePolicy::new("orders");
        svc.rate_limits.push(RateLimitPolicy::new(3, 0, Duration::from_secs(1)));
        assert!(matches!(
            svc.validate(),
            Err(InvalidPolicy::RateLimit { id: 3, .. })
        ));

        let mut svc = ServicePolicy::new("orders");
        svc.concurrency = Some(ConcurrencyLimitPolicy { max_active: 0 });
        assert!(matches!(
            svc.validate(),
            Err(InvalidPolicy::Concurrency { .. })
        ));
    }

    #[test]
    fn breakers_by_level() {
        let mut svc = ServicePolicy::new("orders");
        svc.circuit_breakers.push(CircuitBreakPolicy::new(1));
        svc.circuit_breakers.push(CircuitBreakPolicy {
            level: BreakerLevel::Instance,
            ..CircuitBreakPolicy::new(2)
        });
        let ids = svc
            .breakers(BreakerLevel::Instance)
            .map(|cb| cb.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2]);
        assert!(svc.validate().is_ok());
    }
}
