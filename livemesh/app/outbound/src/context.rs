use crate::{
    balance::Balancers,
    cluster::{AppStatus, Invocation, LiveCluster, Readiness},
    errors::{DefaultErrorParser, ErrorCause, ErrorParser},
    filter::{self, FilterChain, OutboundFilter},
    invoker::{ClusterInvoker, Dispatch, RetryExecutor, TokioRetryExecutor},
    metrics::OutboundMetrics,
    Config, OutboundInvocation,
};
use ahash::AHashMap;
use livemesh_circuit_breaker::BreakerRegistry;
use livemesh_counter::CounterRegistry;
use livemesh_error::Error;
use livemesh_policy::{PolicySupplier, RetryPolicy, ServicePolicy};
use livemesh_rate_limit::RateLimiterRegistry;
use std::{fmt, sync::Arc};
use tracing::debug;

/// The process-wide state shared by all outbound calls through one kind of
/// cluster.
pub struct InvocationContext<C: LiveCluster> {
    config: Config,
    policies: Arc<dyn PolicySupplier>,
    status: Arc<dyn AppStatus>,
    counters: CounterRegistry,
    breakers: BreakerRegistry,
    limiters: RateLimiterRegistry,
    balancers: Balancers,
    parsers: AHashMap<String, Arc<dyn ErrorParser<C::Response>>>,
    default_parser: Arc<dyn ErrorParser<C::Response>>,
    executor: Arc<dyn RetryExecutor>,
    chain: FilterChain<C>,
    metrics: OutboundMetrics,
}

pub struct Builder<C: LiveCluster> {
    config: Config,
    policies: Arc<dyn PolicySupplier>,
    status: Arc<dyn AppStatus>,
    balancers: Option<Balancers>,
    parsers: AHashMap<String, Arc<dyn ErrorParser<C::Response>>>,
    executor: Option<Arc<dyn RetryExecutor>>,
    filters: Option<Vec<Arc<dyn OutboundFilter<C>>>>,
    metrics: OutboundMetrics,
}

// === impl InvocationContext ===

impl<C: LiveCluster> InvocationContext<C> {
    pub fn builder(config: Config, policies: Arc<dyn PolicySupplier>) -> Builder<C> {
        Builder {
            config,
            policies,
            status: Arc::new(Readiness::default()),
            balancers: None,
            parsers: AHashMap::default(),
            executor: None,
            filters: None,
            metrics: OutboundMetrics::default(),
        }
    }

    /// Governs one call to `cluster`, completing with a response in every
    /// case. Retries, if any, are driven by the caller's task.
    pub async fn invoke(self: &Arc<Self>, cluster: &Arc<C>, request: C::Request) -> C::Response {
        self.invoke_with(cluster, request, Dispatch::Inline).await
    }

    /// Like [`InvocationContext::invoke`], choosing how retries are
    /// scheduled.
    pub async fn invoke_with(
        self: &Arc<Self>,
        cluster: &Arc<C>,
        request: C::Request,
        dispatch: Dispatch,
    ) -> C::Response {
        let inv = self.invocation(request);
        self.execute(cluster, inv, dispatch).await
    }

    /// Governs a call whose invocation was prepared by the caller, e.g. with
    /// pre-resolved candidates.
    pub async fn execute(
        self: &Arc<Self>,
        cluster: &Arc<C>,
        inv: Invocation<C>,
        dispatch: Dispatch,
    ) -> C::Response {
        let invoker = ClusterInvoker::from(inv.policy().cluster.strategy);
        debug!(service = %inv.service(), ?invoker, "Invoking");
        invoker.execute(self.clone(), cluster.clone(), inv, dispatch).await
    }

    /// Builds an invocation bound to the current policy for the request's
    /// service.
    pub fn invocation(&self, request: C::Request) -> Invocation<C> {
        use crate::OutboundRequest;
        let policy = self.service_policy(request.service());
        OutboundInvocation::new(request, policy)
    }

    pub fn service_policy(&self, service: &str) -> Arc<ServicePolicy> {
        self.policies
            .service(service)
            .unwrap_or_else(|| Arc::new(ServicePolicy::new(service)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counters(&self) -> &CounterRegistry {
        &self.counters
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    pub fn balancers(&self) -> &Balancers {
        &self.balancers
    }

    pub fn metrics(&self) -> &OutboundMetrics {
        &self.metrics
    }

    pub(crate) fn chain(&self) -> &FilterChain<C> {
        &self.chain
    }

    pub(crate) fn executor(&self) -> &Arc<dyn RetryExecutor> {
        &self.executor
    }

    /// Returns true if outbound calls are currently permitted.
    pub fn is_ready(&self) -> bool {
        self.status.is_ready() && self.status.outbound()
    }

    fn parser(&self, name: Option<&str>) -> &Arc<dyn ErrorParser<C::Response>> {
        let Some(name) = name else {
            return &self.default_parser;
        };
        match self.parsers.get(name) {
            Some(parser) => parser,
            None => {
                debug!(parser = %name, "Unknown error parser; using default");
                &self.default_parser
            }
        }
    }

    pub(crate) fn parse_error(&self, retry: Option<&RetryPolicy>, error: &Error) -> ErrorCause {
        self.parser(retry.and_then(|r| r.error_parser.as_deref()))
            .parse_error(error)
    }

    pub(crate) fn parse_response(
        &self,
        retry: Option<&RetryPolicy>,
        rsp: &C::Response,
    ) -> Option<ErrorCause> {
        self.parser(retry.and_then(|r| r.error_parser.as_deref()))
            .parse_response(rsp)
    }
}

impl<C: LiveCluster> fmt::Debug for InvocationContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("config", &self.config)
            .field("filters", &self.chain)
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// === impl Builder ===

impl<C: LiveCluster> Builder<C> {
    pub fn status(mut self, status: Arc<dyn AppStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn balancers(mut self, balancers: Balancers) -> Self {
        self.balancers = Some(balancers);
        self
    }

    pub fn error_parser(
        mut self,
        name: impl Into<String>,
        parser: Arc<dyn ErrorParser<C::Response>>,
    ) -> Self {
        self.parsers.insert(name.into(), parser);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RetryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the default filter set.
    pub fn filters(mut self, filters: Vec<Arc<dyn OutboundFilter<C>>>) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn metrics(mut self, metrics: OutboundMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds the context. Unless an executor was provided, detached retries
    /// are scheduled on a runtime sized by the config's `retry_threads`, or
    /// on the current runtime when it is zero.
    pub fn build(self) -> std::io::Result<InvocationContext<C>> {
        let Self {
            config,
            policies,
            status,
            balancers,
            parsers,
            executor,
            filters,
            metrics,
        } = self;

        let executor = match executor {
            Some(executor) => executor,
            None => Arc::new(TokioRetryExecutor::from_config(&config)?),
        };
        let filters = filters.unwrap_or_else(filter::defaults);

        Ok(InvocationContext {
            counters: CounterRegistry::new(config.counter_clean_interval),
            breakers: BreakerRegistry::new(vec![metrics.breakers().listener()]),
            limiters: RateLimiterRegistry::default(),
            balancers: balancers.unwrap_or_default(),
            chain: FilterChain::new(filters),
            default_parser: Arc::new(DefaultErrorParser),
            config,
            policies,
            status,
            parsers,
            executor,
            metrics,
        })
    }
}
