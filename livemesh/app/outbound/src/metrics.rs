use crate::errors::FaultType;
use livemesh_circuit_breaker::{State, StateListener, Transition};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct OutboundMetrics {
    attempts: Family<ServiceLabels, Counter>,
    retries: Family<RetryLabels, Counter>,
    rejections: Family<RejectLabels, Counter>,
    breakers: BreakerMetrics,
}

/// Counts circuit breaker state transitions.
#[derive(Clone, Debug, Default)]
pub struct BreakerMetrics {
    transitions: Family<TransitionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ServiceLabels {
    service: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RetryLabels {
    service: String,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RejectLabels {
    service: String,
    fault: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TransitionLabels {
    resource: String,
    state: &'static str,
}

// === impl OutboundMetrics ===

impl OutboundMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let attempts = Family::default();
        reg.register(
            "attempts",
            "The number of calls sent to an endpoint",
            attempts.clone(),
        );

        let retries = Family::default();
        reg.register(
            "retry_outcomes",
            "The terminal outcomes of calls governed by a retry policy",
            retries.clone(),
        );

        let rejections = Family::default();
        reg.register(
            "rejections",
            "The number of calls rejected or failed by governance policy",
            rejections.clone(),
        );

        let breakers = BreakerMetrics::register(reg);

        Self {
            attempts,
            retries,
            rejections,
            breakers,
        }
    }

    pub fn breakers(&self) -> &BreakerMetrics {
        &self.breakers
    }

    pub(crate) fn attempt(&self, service: &str) {
        self.attempts
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .inc();
    }

    pub(crate) fn retry_outcome(&self, service: &str, outcome: &'static str) {
        self.retries
            .get_or_create(&RetryLabels {
                service: service.to_string(),
                outcome,
            })
            .inc();
    }

    pub(crate) fn rejected(&self, service: &str, fault: FaultType) {
        self.rejections
            .get_or_create(&RejectLabels {
                service: service.to_string(),
                fault: fault.as_str(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self, service: &str) -> u64 {
        self.attempts
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn retry_outcomes(&self, service: &str, outcome: &'static str) -> u64 {
        self.retries
            .get_or_create(&RetryLabels {
                service: service.to_string(),
                outcome,
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn rejections(&self, service: &str, fault: FaultType) -> u64 {
        self.rejections
            .get_or_create(&RejectLabels {
                service: service.to_string(),
                fault: fault.as_str(),
            })
            .get()
    }
}

// === impl BreakerMetrics ===

impl BreakerMetrics {
    fn register(reg: &mut Registry) -> Self {
        let transitions = Family::default();
        reg.register(
            "breaker_transitions",
            "The number of circuit breaker state transitions",
            transitions.clone(),
        );
        Self { transitions }
    }

    pub fn listener(&self) -> Arc<dyn StateListener> {
        Arc::new(self.clone())
    }
}

impl StateListener for BreakerMetrics {
    fn on_transition(&self, t: &Transition<'_>) {
        let resource = match t.instance {
            Some(instance) => format!("{}/{}", t.resource, instance),
            None => t.resource.to_string(),
        };
        let state = match t.to {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        };
        self.transitions
            .get_or_create(&TransitionLabels { resource, state })
            .inc();
    }
}
