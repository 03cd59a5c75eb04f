use ahash::AHashMap;
use std::{fmt, net::SocketAddr, sync::Arc};

/// The label that places an endpoint on a lane.
pub const LABEL_LANE: &str = "x-live-lane";

/// A reachable service instance.
///
/// Endpoints are owned by discovery and shared between invocations, so the
/// handle is cheap to clone and immutable.
#[derive(Clone)]
pub struct Endpoint(Arc<Inner>);

struct Inner {
    id: Arc<str>,
    addr: SocketAddr,
    weight: u32,
    state: EndpointState,
    labels: AHashMap<String, String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointState {
    Healthy,
    /// Recently started and still ramping up.
    Warmup,
    /// Temporarily removed from service by an operator.
    Suspend,
    /// Shutting down.
    Closing,
    /// Previously unhealthy and returning to service.
    Recover,
}

// === impl EndpointState ===

impl EndpointState {
    /// Whether new calls may be sent to an endpoint in this state.
    pub fn is_accessible(&self) -> bool {
        matches!(self, Self::Healthy | Self::Warmup | Self::Recover)
    }
}

// === impl Endpoint ===

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self::builder(addr.to_string(), addr).build()
    }

    pub fn builder(id: impl Into<Arc<str>>, addr: SocketAddr) -> Builder {
        Builder {
            id: id.into(),
            addr,
            weight: 100,
            state: EndpointState::Healthy,
            labels: AHashMap::default(),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.0.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    pub fn weight(&self) -> u32 {
        self.0.weight
    }

    pub fn state(&self) -> EndpointState {
        self.0.state
    }

    pub fn is_accessible(&self) -> bool {
        self.0.state.is_accessible()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0.labels.get(key).map(String::as_str)
    }

    pub fn lane(&self) -> Option<&str> {
        self.label(LABEL_LANE)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.id == other.0.id
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.0.id)
            .field("addr", &self.0.addr)
            .field("weight", &self.0.weight)
            .field("state", &self.0.state)
            .field("labels", &self.0.labels)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.id.fmt(f)
    }
}

#[must_use]
#[derive(Debug)]
pub struct Builder {
    id: Arc<str>,
    addr: SocketAddr,
    weight: u32,
    state: EndpointState,
    labels: AHashMap<String, String>,
}

// === impl Builder ===

impl Builder {
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn state(mut self, state: EndpointState) -> Self {
        self.state = state;
        self
    }

    pub fn lane(self, lane: impl Into<String>) -> Self {
        self.label(LABEL_LANE, lane)
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Endpoint {
        Endpoint(Arc::new(Inner {
            id: self.id,
            addr: self.addr,
            weight: self.weight,
            state: self.state,
            labels: self.labels,
        }))
    }
}
