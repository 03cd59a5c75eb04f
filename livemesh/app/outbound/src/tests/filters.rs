use super::*;
use crate::{
    errors::{CircuitBreak, FaultInjected, NoProvider, RejectAuth, RejectLimit},
    filter::{self, Chain, FilterChain, FilterFuture, OutboundFilter},
    Invocation, AUTH_REQUIRED, STICKY_ID,
};
use livemesh_policy::{
    AuthPolicy, BreakerLevel, CircuitBreakPolicy, ConcurrencyLimitPolicy, DegradeConfig, Fault,
    FaultInjectionPolicy, LoadBalance, RateLimitPolicy, StickyType, TagCondition, TagOp, TagRoute,
};
use livemesh_circuit_breaker::State;
use livemesh_route::{Endpoint, EndpointState, LABEL_LANE};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

/// Records its name and continues the chain.
struct Recorder {
    order: i32,
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl OutboundFilter<MockCluster> for Recorder {
    fn order(&self) -> i32 {
        self.order
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn filter<'a>(
        &'a self,
        inv: &'a mut Invocation<MockCluster>,
        chain: Chain<'a, MockCluster>,
    ) -> FilterFuture<'a, MockCluster> {
        self.log.lock().push(self.name);
        chain.proceed(inv)
    }
}

#[test]
fn default_filters_are_ordered() {
    let chain = FilterChain::<MockCluster>::new(filter::defaults());
    assert_eq!(
        chain.names().collect::<Vec<_>>(),
        [
            "auth",
            "fault-injection",
            "health",
            "lane",
            "load-balance",
            "rate-limit",
            "tag-route",
            "circuit-breaker",
            "instance-circuit-breaker",
            "counter",
            "invoke",
        ]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn filters_run_in_ascending_order() {
    let _trace = livemesh_tracing::test::trace_init();

    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |order, name| -> Arc<dyn OutboundFilter<MockCluster>> {
        Arc::new(Recorder {
            order,
            name,
            log: log.clone(),
        })
    };
    let filters: Vec<Arc<dyn OutboundFilter<MockCluster>>> = vec![
        recorder(filter::ORDER_COUNTER, "counter"),
        Arc::new(filter::InvokeFilter),
        recorder(filter::ORDER_AUTH, "auth"),
        recorder(filter::ORDER_TAG_ROUTE, "tag-route"),
        Arc::new(filter::LoadBalanceFilter),
        recorder(filter::ORDER_HEALTH, "health"),
    ];
    let ctx = context_with(service(), |b| b.filters(filters));
    let cluster = MockCluster::new(endpoints(2));

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
    assert_eq!(*log.lock(), ["auth", "health", "tag-route", "counter"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn saturated_endpoints_reject_with_limit() {
    let _trace = livemesh_tracing::test::trace_init();

    let policy = ServicePolicy {
        concurrency: Some(ConcurrencyLimitPolicy { max_active: 1 }),
        ..service()
    };
    let ctx = context(policy);
    let cluster = MockCluster::new(endpoints(1));
    cluster.set_latency(Duration::from_secs(1));

    let (a, b) = tokio::join!(
        invoke(&ctx, &cluster, MockRequest::default()),
        invoke(&ctx, &cluster, MockRequest::default()),
    );
    let (ok, rejected) = if a.is_ok() { (a, b) } else { (b, a) };
    assert!(ok.is_ok(), "{ok:?}");
    let error = rejected.into_error();
    assert!(
        matches!(
            error.downcast_ref::<RejectLimit>(),
            Some(RejectLimit::Concurrency { max_active: 1, .. })
        ),
        "{error}"
    );
    assert_eq!(cluster.call_count(), 1);

    let counter = ctx
        .counters()
        .counter(SERVICE, &endpoint(1))
        .snapshot();
    assert_eq!(counter.active, 0);
    assert_eq!(counter.succeeded, 1);
    assert_eq!(counter.failed, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn lanes_fall_back_to_the_base_lane() {
    let _trace = livemesh_tracing::test::trace_init();

    let beta = Endpoint::builder("beta", addr(1)).lane("beta").build();
    let base = Endpoint::builder("base", addr(2)).build();
    let ctx = context(service());
    let cluster = MockCluster::new(vec![beta.clone(), base.clone()]);

    for _ in 0..4 {
        let rsp = invoke(
            &ctx,
            &cluster,
            MockRequest::default().with_attribute(LABEL_LANE, "beta"),
        )
        .await;
        assert_eq!(rsp.endpoint(), "beta");

        let rsp = invoke(
            &ctx,
            &cluster,
            MockRequest::default().with_attribute(LABEL_LANE, "gamma"),
        )
        .await;
        assert_eq!(rsp.endpoint(), "base");

        let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
        assert_eq!(rsp.endpoint(), "base");
    }

    // Without a base lane, any endpoint will do.
    cluster.set_endpoints(vec![beta]);
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert_eq!(rsp.endpoint(), "beta");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn inaccessible_endpoints_are_skipped() {
    let _trace = livemesh_tracing::test::trace_init();

    let suspended = Endpoint::builder("suspended", addr(1))
        .state(EndpointState::Suspend)
        .build();
    let healthy = Endpoint::builder("healthy", addr(2)).build();
    let ctx = context(service());
    let cluster = MockCluster::new(vec![suspended.clone(), healthy]);

    for _ in 0..4 {
        let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
        assert_eq!(rsp.endpoint(), "healthy");
    }

    cluster.set_endpoints(vec![suspended]);
    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(error.is::<NoProvider>(), "{error}");
}

fn breaker(id: u64, level: BreakerLevel) -> CircuitBreakPolicy {
    CircuitBreakPolicy {
        level,
        minimum_calls: 2,
        wait_in_open: Duration::from_secs(10),
        ..CircuitBreakPolicy::new(id)
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn open_service_breakers_degrade() {
    let _trace = livemesh_tracing::test::trace_init();

    let mut cb = breaker(1, BreakerLevel::Service);
    cb.degrade = Some(DegradeConfig {
        code: "200".to_string(),
        body: "[]".to_string(),
        ..DegradeConfig::default()
    });
    let ctx = context(ServicePolicy {
        circuit_breakers: vec![cb],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(2));
    cluster.script(errors(2));

    for _ in 0..2 {
        let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
        assert!(matches!(rsp, MockResponse::Failed(_)), "{rsp:?}");
    }
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(
        matches!(&rsp, MockResponse::Degraded { code, body } if code == "200" && body == "[]"),
        "{rsp:?}"
    );
    assert_eq!(cluster.call_count(), 2);

    // After the cool-down a single trial is admitted and closes the breaker.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn open_service_breakers_reject() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(ServicePolicy {
        circuit_breakers: vec![breaker(1, BreakerLevel::Service)],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(2));
    cluster.script(errors(2));

    for _ in 0..2 {
        invoke(&ctx, &cluster, MockRequest::default()).await;
    }
    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(error.is::<CircuitBreak>(), "{error}");
    assert_eq!(
        ctx.metrics()
            .rejections(SERVICE, crate::errors::FaultType::CircuitBreak),
        1
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn broken_instances_are_reselected() {
    let _trace = livemesh_tracing::test::trace_init();

    let mut cb = breaker(7, BreakerLevel::Instance);
    cb.minimum_calls = 1;
    let ctx = context(ServicePolicy {
        load_balance: livemesh_policy::LoadBalancePolicy {
            balance: LoadBalance::RoundRobin,
            ..Default::default()
        },
        circuit_breakers: vec![cb],
        ..service()
    });
    let bad = endpoint(1);
    let good = endpoint(2);
    let cluster = MockCluster::new(vec![bad.clone(), good.clone()]);
    cluster.fail(&bad);

    // Round-robin reaches the failing endpoint within two calls.
    for _ in 0..2 {
        invoke(&ctx, &cluster, MockRequest::default()).await;
    }
    assert!(ctx.breakers().is_broken(7, bad.id(), Instant::now()));

    let before = cluster.call_count();
    for _ in 0..6 {
        let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
        assert_eq!(rsp.endpoint(), good.id().as_ref());
    }
    assert!(cluster.calls()[before..]
        .iter()
        .all(|c| c.endpoint == *good.id()));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reselection_stops_when_every_endpoint_is_rejected() {
    let _trace = livemesh_tracing::test::trace_init();

    let mut cb = breaker(3, BreakerLevel::Instance);
    cb.force_open = true;
    let ctx = context(ServicePolicy {
        circuit_breakers: vec![cb],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(3));

    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    // The rejection surfaces as its reason.
    assert!(error.is::<CircuitBreak>(), "{error}");
    assert_eq!(cluster.call_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancelled_half_open_calls_release_the_breaker() {
    let _trace = livemesh_tracing::test::trace_init();

    let cb = breaker(1, BreakerLevel::Service);
    let ctx = context(ServicePolicy {
        circuit_breakers: vec![cb.clone()],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(2));
    cluster.script(errors(2));

    for _ in 0..2 {
        invoke(&ctx, &cluster, MockRequest::default()).await;
    }
    let breaker = ctx.breakers().service(&cb, SERVICE);
    assert_eq!(breaker.state(), State::Open);

    // The only half-open admission is abandoned by the caller.
    tokio::time::sleep(Duration::from_secs(10)).await;
    cluster.set_latency(Duration::from_secs(1));
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        invoke(&ctx, &cluster, MockRequest::default()),
    )
    .await;
    assert!(abandoned.is_err(), "{abandoned:?}");
    assert_eq!(breaker.state(), State::HalfOpen);

    cluster.set_latency(Duration::ZERO);
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
    assert_eq!(breaker.state(), State::Closed);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn rejected_endpoints_return_service_permits() {
    let _trace = livemesh_tracing::test::trace_init();

    let service_cb = breaker(1, BreakerLevel::Service);
    let instance_cb = breaker(7, BreakerLevel::Instance);
    let ctx = context(ServicePolicy {
        load_balance: livemesh_policy::LoadBalancePolicy {
            sticky: StickyType::Preferred,
            ..Default::default()
        },
        circuit_breakers: vec![service_cb.clone(), instance_cb.clone()],
        ..service()
    });
    let bad = endpoint(1);
    let good = endpoint(2);
    let cluster = MockCluster::new(vec![bad.clone(), good.clone()]);

    // Leave the service breaker half-open with a single admission.
    let service_breaker = ctx.breakers().service(&service_cb, SERVICE);
    for _ in 0..2 {
        service_breaker.on_error(Duration::ZERO, None);
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    let instance_breaker = ctx.breakers().instance(&instance_cb, SERVICE, bad.id());
    for _ in 0..2 {
        instance_breaker.on_error(Duration::ZERO, None);
    }
    assert!(ctx.breakers().is_broken(7, bad.id(), Instant::now()));

    // The sticky endpoint is rejected by its breaker after the service
    // admission was taken; the reselected endpoint needs that admission.
    let rsp = invoke(
        &ctx,
        &cluster,
        MockRequest::default().with_attribute(STICKY_ID, bad.id().as_ref()),
    )
    .await;
    assert_eq!(rsp.endpoint(), good.id().as_ref());
    assert!(cluster.calls().iter().all(|c| c.endpoint == *good.id()));
    assert_eq!(service_breaker.state(), State::Closed);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn tag_routes_select_labelled_endpoints() {
    let _trace = livemesh_tracing::test::trace_init();

    let route = TagRoute {
        id: 1,
        conditions: vec![TagCondition::new("region", TagOp::Equal, ["eu".to_string()])],
        destination: [("region".to_string(), "eu".to_string())].into(),
    };
    let ctx = context(ServicePolicy {
        tag_routes: vec![route],
        ..service()
    });
    let eu = Endpoint::builder("eu", addr(2)).label("region", "eu").build();
    let cluster = MockCluster::new(vec![endpoint(1), eu, endpoint(3)]);

    for _ in 0..8 {
        let rsp = invoke(
            &ctx,
            &cluster,
            MockRequest::default().with_attribute("region", "eu"),
        )
        .await;
        assert_eq!(rsp.endpoint(), "eu");
    }

    // Requests that match no route may go anywhere.
    let mut seen = ahash::AHashSet::new();
    for _ in 0..64 {
        let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
        seen.insert(rsp.endpoint().to_string());
    }
    assert!(seen.len() > 1, "{seen:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unsatisfiable_tag_routes_fall_back() {
    let _trace = livemesh_tracing::test::trace_init();

    let route = TagRoute {
        id: 1,
        conditions: vec![],
        destination: [("region".to_string(), "ap".to_string())].into(),
    };
    let ctx = context(ServicePolicy {
        tag_routes: vec![route],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(2));

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sticky_calls_prefer_their_endpoint() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(ServicePolicy {
        load_balance: livemesh_policy::LoadBalancePolicy {
            sticky: StickyType::Preferred,
            ..Default::default()
        },
        ..service()
    });
    let cluster = MockCluster::new(endpoints(4));
    let sticky = endpoint(3);

    for _ in 0..8 {
        let rsp = invoke(
            &ctx,
            &cluster,
            MockRequest::default().with_attribute(STICKY_ID, sticky.id().as_ref()),
        )
        .await;
        assert_eq!(rsp.endpoint(), sticky.id().as_ref());
    }

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    let chosen = rsp.endpoint().to_string();
    let calls = cluster.calls();
    let last = calls.last().expect("must have called");
    assert_eq!(
        last.attributes.get(STICKY_ID).map(String::as_str),
        Some(chosen.as_str())
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn auth_tokens_are_attached() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(ServicePolicy {
        auth: Some(AuthPolicy::Token {
            key: "x-token".to_string(),
            value: "secret".to_string(),
        }),
        ..service()
    });
    let cluster = MockCluster::new(endpoints(1));

    let rsp = invoke(
        &ctx,
        &cluster,
        MockRequest::default().with_attribute(AUTH_REQUIRED, "true"),
    )
    .await;
    assert!(rsp.is_ok(), "{rsp:?}");
    assert_eq!(
        cluster.calls()[0].attributes.get("x-token").map(String::as_str),
        Some("secret")
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn auth_required_without_credentials() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(failover(3, Duration::from_millis(10), Duration::from_secs(1)));
    let cluster = MockCluster::new(endpoints(1));

    let error = invoke(
        &ctx,
        &cluster,
        MockRequest::default().with_attribute(AUTH_REQUIRED, "true"),
    )
    .await
    .into_error();
    assert!(error.is::<RejectAuth>(), "{error}");
    assert_eq!(cluster.call_count(), 0);
    assert_eq!(cluster.routes(), 1);
}

fn fault(fault: Fault, lanes: Vec<String>) -> FaultInjectionPolicy {
    FaultInjectionPolicy {
        id: 9,
        fault,
        percent: 100.0,
        lanes,
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn injected_aborts() {
    let _trace = livemesh_tracing::test::trace_init();

    let abort = Fault::Abort {
        code: "503".to_string(),
        message: "injected".to_string(),
    };
    let ctx = context(ServicePolicy {
        fault_injections: vec![fault(abort, vec!["canary".to_string()])],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(1));

    let error = invoke(
        &ctx,
        &cluster,
        MockRequest::default().with_attribute(LABEL_LANE, "canary"),
    )
    .await
    .into_error();
    let injected = error
        .downcast_ref::<FaultInjected>()
        .expect("fault must be injected");
    assert_eq!(injected.code, "503");
    assert_eq!(cluster.call_count(), 0);

    // Other lanes are unaffected.
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn injected_delays() {
    let _trace = livemesh_tracing::test::trace_init();

    let delay = Duration::from_millis(200);
    let ctx = context(ServicePolicy {
        fault_injections: vec![fault(Fault::Delay(delay), vec![])],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(1));

    let start = Instant::now();
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
    assert_eq!(start.elapsed(), delay);
}

#[tokio::test(flavor = "current_thread")]
async fn rate_limited_calls_are_rejected() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(ServicePolicy {
        rate_limits: vec![RateLimitPolicy::new(4, 1, Duration::from_secs(60))],
        ..service()
    });
    let cluster = MockCluster::new(endpoints(2));

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");

    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(
        matches!(error.downcast_ref::<RejectLimit>(), Some(RejectLimit::Rate(_))),
        "{error}"
    );
    assert_eq!(cluster.call_count(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reselection_does_not_take_more_rate_limit_permits() {
    let _trace = livemesh_tracing::test::trace_init();

    let route = TagRoute {
        id: 1,
        conditions: vec![],
        destination: [("region".to_string(), "eu".to_string())].into(),
    };
    let ctx = context(ServicePolicy {
        load_balance: livemesh_policy::LoadBalancePolicy {
            sticky: StickyType::Preferred,
            ..Default::default()
        },
        rate_limits: vec![RateLimitPolicy::new(4, 1, Duration::from_secs(60))],
        tag_routes: vec![route],
        ..service()
    });
    let eu = Endpoint::builder("eu", addr(2)).label("region", "eu").build();
    let cluster = MockCluster::new(vec![endpoint(1), eu]);

    // The sticky endpoint lies outside the route, so the call is reselected.
    let rsp = invoke(
        &ctx,
        &cluster,
        MockRequest::default().with_attribute(STICKY_ID, endpoint(1).id().as_ref()),
    )
    .await;
    assert_eq!(rsp.endpoint(), "eu");
    assert_eq!(cluster.call_count(), 1);

    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(
        matches!(error.downcast_ref::<RejectLimit>(), Some(RejectLimit::Rate(_))),
        "{error}"
    );
}
