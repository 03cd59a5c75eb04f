use livemesh_route::Endpoint;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadBalance {
    #[default]
    Random,
    RoundRobin,
    WeightedRandom,
    LeastActive,
}

/// Whether a call prefers the endpoint that served the caller's previous
/// call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum StickyType {
    #[default]
    None,
    Preferred,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancePolicy {
    pub balance: LoadBalance,
    pub sticky: StickyType,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TagOp {
    Equal,
    NotEqual,
    In,
    Prefix,
}

/// A predicate on a single request attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagCondition {
    pub key: String,
    pub op: TagOp,
    pub values: Vec<String>,
}

/// Directs requests that satisfy every condition to endpoints carrying every
/// destination label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagRoute {
    pub id: u64,
    pub conditions: Vec<TagCondition>,
    pub destination: BTreeMap<String, String>,
}

// === impl TagCondition ===

impl TagCondition {
    pub fn new(key: impl Into<String>, op: TagOp, values: impl IntoIterator<Item = String>) -> Self {
        Self {
            key: key.into(),
            op,
            values: values.into_iter().collect(),
        }
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        match (self.op, value) {
            // An absent attribute is unequal to everything.
            (TagOp::NotEqual, None) => true,
            (_, None) => false,
            (TagOp::Equal, Some(v)) => self.values.first().is_some_and(|x| x == v),
            (TagOp::NotEqual, Some(v)) => self.values.iter().all(|x| x != v),
            (TagOp::In, Some(v)) => self.values.iter().any(|x| x == v),
            (TagOp::Prefix, Some(v)) => self.values.iter().any(|x| v.starts_with(x.as_str())),
        }
    }
}

// === impl TagRoute ===

impl TagRoute {
    pub fn matches_request<'a, F>(&self, mut attribute: F) -> bool
    where
        F: FnMut(&str) -> Option<&'a str>,
    {
        self.conditions
            .iter()
            .all(|c| c.matches(attribute(&c.key)))
    }

    pub fn selects(&self, endpoint: &Endpoint) -> bool {
        self.destination
            .iter()
            .all(|(k, v)| endpoint.label(k) == Some(v.as_str()))
    }
}
