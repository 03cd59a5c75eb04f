use crate::{
    errors::Unretryable, Config, Dispatch, Invocation, InvocationContext, LiveCluster,
    OutboundRequest, OutboundResponse,
};
use ahash::{AHashMap, AHashSet};
use futures::future::{self, BoxFuture};
use livemesh_error::{Error, Result};
use livemesh_policy::{DegradeConfig, GovernancePolicy, ServicePolicy, WatchPolicySupplier};
use livemesh_route::Endpoint;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub const SERVICE: &str = "orders";

#[derive(Clone, Debug)]
pub struct MockRequest {
    service: String,
    method: Option<String>,
    attributes: AHashMap<String, String>,
}

#[derive(Debug)]
pub enum MockResponse {
    Ok { endpoint: Arc<str>, code: String },
    Failed(Error),
    Empty,
    Degraded { code: String, body: String },
}

/// What the mock endpoint does when it is called.
#[derive(Clone, Debug)]
pub enum Outcome {
    Code(&'static str),
    Error(&'static str),
    Unretryable(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub endpoint: Arc<str>,
    pub attempt: u32,
    pub attributes: AHashMap<String, String>,
}

/// A cluster whose endpoints answer from a script. Once the script runs out,
/// endpoints answer with a `200` code.
#[derive(Debug, Default)]
pub struct MockCluster {
    endpoints: Mutex<Vec<Endpoint>>,
    script: Mutex<VecDeque<Outcome>>,
    failing: Mutex<AHashSet<Arc<str>>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<Call>>,
    routes: AtomicUsize,
    hooks: Mutex<Vec<&'static str>>,
    failing_hooks: AtomicBool,
    destroyed: AtomicBool,
}

pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 8080))
}

pub fn endpoint(n: u8) -> Endpoint {
    Endpoint::new(addr(n))
}

pub fn endpoints(n: u8) -> Vec<Endpoint> {
    (1..=n).map(endpoint).collect()
}

pub fn supplier(service: ServicePolicy) -> Arc<WatchPolicySupplier> {
    Arc::new(WatchPolicySupplier::fixed(
        GovernancePolicy::new(1).with_service(service),
    ))
}

pub fn context(service: ServicePolicy) -> Arc<InvocationContext<MockCluster>> {
    context_with(service, |b| b)
}

pub fn context_with(
    service: ServicePolicy,
    f: impl FnOnce(crate::Builder<MockCluster>) -> crate::Builder<MockCluster>,
) -> Arc<InvocationContext<MockCluster>> {
    let builder = InvocationContext::builder(Config::default(), supplier(service));
    Arc::new(f(builder).build().expect("context must build"))
}

pub async fn invoke(
    ctx: &Arc<InvocationContext<MockCluster>>,
    cluster: &Arc<MockCluster>,
    request: MockRequest,
) -> MockResponse {
    ctx.invoke_with(cluster, request, Dispatch::Inline).await
}

// === impl MockRequest ===

impl MockRequest {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: None,
            attributes: AHashMap::default(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for MockRequest {
    fn default() -> Self {
        Self::new(SERVICE)
    }
}

impl OutboundRequest for MockRequest {
    fn service(&self) -> &str {
        &self.service
    }

    fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    fn set_attribute(&mut self, key: &str, value: &str) {
        self.attributes.insert(key.to_string(), value.to_string());
    }
}

// === impl MockResponse ===

impl MockResponse {
    #[track_caller]
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Ok { endpoint, .. } => endpoint,
            rsp => panic!("expected a response from an endpoint, got {rsp:?}"),
        }
    }

    #[track_caller]
    pub fn into_error(self) -> Error {
        match self {
            Self::Failed(error) => error,
            rsp => panic!("expected a failure, got {rsp:?}"),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

impl OutboundResponse for MockResponse {
    fn code(&self) -> Option<&str> {
        match self {
            Self::Ok { code, .. } | Self::Degraded { code, .. } => Some(code),
            _ => None,
        }
    }

    fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

// === impl MockCluster ===

impl MockCluster {
    pub fn new(endpoints: Vec<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(endpoints),
            ..Self::default()
        })
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().extend(outcomes);
    }

    /// Makes calls to `endpoint` fail with a connection error.
    pub fn fail(&self, endpoint: &Endpoint) {
        self.failing.lock().insert(endpoint.id().clone());
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.lock() = endpoints;
    }

    pub fn set_failing_hooks(&self, failing: bool) {
        self.failing_hooks.store(failing, Ordering::Release);
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn routes(&self) -> usize {
        self.routes.load(Ordering::Acquire)
    }

    pub fn hooks(&self) -> Vec<&'static str> {
        self.hooks.lock().clone()
    }

    fn hook(&self, name: &'static str) -> Result<()> {
        self.hooks.lock().push(name);
        if self.failing_hooks.load(Ordering::Acquire) {
            return Err(format!("{name} hook failed").into());
        }
        Ok(())
    }
}

impl LiveCluster for MockCluster {
    type Request = MockRequest;
    type Response = MockResponse;

    fn route(&self, _: &Invocation<Self>) -> BoxFuture<'static, Result<Vec<Endpoint>>> {
        self.routes.fetch_add(1, Ordering::AcqRel);
        Box::pin(future::ready(Ok(self.endpoints.lock().clone())))
    }

    fn invoke(
        &self,
        inv: &Invocation<Self>,
        endpoint: &Endpoint,
    ) -> BoxFuture<'static, Result<MockResponse>> {
        self.calls.lock().push(Call {
            endpoint: endpoint.id().clone(),
            attempt: inv.attempt(),
            attributes: inv.request().attributes.clone(),
        });

        let endpoint = endpoint.id().clone();
        let outcome = if self.failing.lock().contains(&endpoint) {
            Outcome::Error("connection refused")
        } else {
            self.script.lock().pop_front().unwrap_or(Outcome::Code("200"))
        };
        let latency = *self.latency.lock();
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match outcome {
                Outcome::Code(code) => Ok(MockResponse::Ok {
                    endpoint,
                    code: code.to_string(),
                }),
                Outcome::Error(message) => Err(message.into()),
                Outcome::Unretryable(message) => Err(Unretryable::new(message).into()),
            }
        })
    }

    fn create_response(&self, _: &Invocation<Self>, error: Error) -> MockResponse {
        MockResponse::Failed(error)
    }

    fn empty_response(&self, _: &Invocation<Self>) -> MockResponse {
        MockResponse::Empty
    }

    fn degrade(&self, _: &Invocation<Self>, config: &DegradeConfig) -> MockResponse {
        MockResponse::Degraded {
            code: config.code.clone(),
            body: config.body.clone(),
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn on_start(&self, _: &Invocation<Self>) -> Result<()> {
        self.hooks.lock().push("start");
        Ok(())
    }

    fn on_success(&self, _: &Invocation<Self>, _: &MockResponse) -> Result<()> {
        self.hook("success")
    }

    fn on_error(&self, _: &Invocation<Self>, _: &Error) -> Result<()> {
        self.hook("error")
    }

    fn on_retry(&self, _: &Invocation<Self>, _: u32) -> Result<()> {
        self.hook("retry")
    }
}
