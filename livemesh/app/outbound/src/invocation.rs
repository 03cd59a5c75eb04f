use livemesh_circuit_breaker::CircuitBreaker;
use livemesh_error::Error;
use livemesh_policy::ServicePolicy;
use livemesh_route::{Endpoint, RouteTarget, LABEL_LANE};
use std::sync::Arc;

/// The request attribute that carries the preferred endpoint for sticky
/// routing.
pub const STICKY_ID: &str = "x-live-sticky-id";

/// The request attribute that marks a call as requiring credentials.
pub const AUTH_REQUIRED: &str = "x-live-auth-required";

/// A request as seen by the governance layer.
pub trait OutboundRequest: Send + Sync + 'static {
    /// The logical service being called.
    fn service(&self) -> &str;

    fn method(&self) -> Option<&str> {
        None
    }

    fn attribute(&self, key: &str) -> Option<&str>;

    fn set_attribute(&mut self, key: &str, value: &str);
}

/// A response as seen by the governance layer.
pub trait OutboundResponse: Send + 'static {
    /// The service-level status code, if the protocol has one.
    fn code(&self) -> Option<&str> {
        None
    }

    /// The error this response was synthesized from.
    fn error(&self) -> Option<&Error> {
        None
    }
}

/// One logical outbound call and the routing state accumulated for it.
#[derive(Debug)]
pub struct OutboundInvocation<R> {
    request: R,
    service: Arc<str>,
    policy: Arc<ServicePolicy>,
    target: Option<RouteTarget>,
    selection: Option<Selection>,
    sticky: Option<Arc<str>>,
    breakers: Breakers,
    /// Set once the current attempt has passed the rate limits.
    rate_limited: bool,
    attempt: u32,
}

/// The endpoint chosen for the current attempt along with the candidates it
/// was chosen from.
#[derive(Clone, Debug)]
pub struct Selection {
    pub endpoint: Endpoint,
    pub candidates: Vec<Endpoint>,
}

/// The breakers that admitted the current attempt.
///
/// Service-level breakers are acquired before the endpoint is known;
/// instance-level breakers are appended once it has been chosen.
#[derive(Debug, Default)]
pub struct Breakers {
    service: Vec<Arc<CircuitBreaker>>,
    instance: Vec<Arc<CircuitBreaker>>,
}

// === impl OutboundInvocation ===

impl<R: OutboundRequest> OutboundInvocation<R> {
    pub fn new(request: R, policy: Arc<ServicePolicy>) -> Self {
        let service = Arc::from(request.service());
        let sticky = request.attribute(STICKY_ID).map(Arc::from);
        Self {
            request,
            service,
            policy,
            target: None,
            selection: None,
            sticky,
            breakers: Breakers::default(),
            rate_limited: false,
            attempt: 0,
        }
    }

    /// Creates an invocation whose candidates have already been resolved.
    pub fn with_target(request: R, policy: Arc<ServicePolicy>, target: RouteTarget) -> Self {
        Self {
            target: Some(target),
            ..Self::new(request, policy)
        }
    }

    pub fn lane(&self) -> Option<&str> {
        self.request.attribute(LABEL_LANE)
    }

    pub fn method(&self) -> Option<&str> {
        self.request.method()
    }
}

impl<R> OutboundInvocation<R> {
    pub fn request(&self) -> &R {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut R {
        &mut self.request
    }

    pub fn into_request(self) -> R {
        self.request
    }

    pub fn service(&self) -> &Arc<str> {
        &self.service
    }

    pub fn policy(&self) -> &Arc<ServicePolicy> {
        &self.policy
    }

    pub fn is_routed(&self) -> bool {
        self.target.is_some()
    }

    /// Returns the candidates for this attempt. An invocation that has not
    /// been routed has none.
    pub fn endpoints(&self) -> &[Endpoint] {
        match self.target.as_ref() {
            Some(target) => target.endpoints(),
            None => &[],
        }
    }

    pub fn target(&self) -> Option<&RouteTarget> {
        self.target.as_ref()
    }

    pub fn target_mut(&mut self) -> Option<&mut RouteTarget> {
        self.target.as_mut()
    }

    pub fn set_target(&mut self, target: RouteTarget) {
        self.target = Some(target);
        self.selection = None;
    }

    /// The endpoint chosen for the current attempt.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.selection.as_ref().map(|s| &s.endpoint)
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn select(&mut self, endpoint: Endpoint, candidates: Vec<Endpoint>) {
        self.selection = Some(Selection {
            endpoint,
            candidates,
        });
    }

    pub fn take_selection(&mut self) -> Option<Selection> {
        self.selection.take()
    }

    /// Drops candidates that do not satisfy `predicate` from the pool the
    /// current endpoint was chosen from.
    pub fn retain_candidates(&mut self, predicate: impl FnMut(&Endpoint) -> bool) {
        if let Some(selection) = self.selection.as_mut() {
            selection.candidates.retain(predicate);
        }
    }

    pub fn sticky_id(&self) -> Option<&Arc<str>> {
        self.sticky.as_ref()
    }

    pub fn set_sticky_id(&mut self, id: Arc<str>) {
        self.sticky = Some(id);
    }

    pub fn breakers(&self) -> &Breakers {
        &self.breakers
    }

    pub fn breakers_mut(&mut self) -> &mut Breakers {
        &mut self.breakers
    }

    /// Returns true if the current attempt already holds rate limit permits.
    /// Reselecting an endpoint does not take new ones.
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub(crate) fn set_rate_limited(&mut self) {
        self.rate_limited = true;
    }

    /// The zero-based index of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Clears per-attempt routing state before a retry.
    pub fn reset_on_retry(&mut self) {
        if let Some(target) = self.target.as_mut() {
            target.reset();
        }
        self.selection = None;
        self.breakers.clear();
        self.rate_limited = false;
    }
}

// === impl Breakers ===

impl Breakers {
    pub fn service(&self) -> &[Arc<CircuitBreaker>] {
        &self.service
    }

    pub fn instance(&self) -> &[Arc<CircuitBreaker>] {
        &self.instance
    }

    pub(crate) fn push_service(&mut self, breaker: Arc<CircuitBreaker>) {
        self.service.push(breaker);
    }

    pub(crate) fn push_instance(&mut self, breaker: Arc<CircuitBreaker>) {
        self.instance.push(breaker);
    }

    pub(crate) fn clear(&mut self) {
        self.service.clear();
        self.instance.clear();
    }
}
