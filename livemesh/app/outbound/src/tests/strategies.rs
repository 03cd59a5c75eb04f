use super::*;
use crate::{
    errors::{NoProvider, RejectUnready},
    Readiness,
};
use livemesh_policy::ClusterStrategy;
use std::sync::Arc;

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failfast_succeeds() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(service());
    let cluster = MockCluster::new(endpoints(2));
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;

    assert!(rsp.is_ok(), "{rsp:?}");
    assert_eq!(cluster.call_count(), 1);
    assert_eq!(cluster.hooks(), ["start", "success"]);
    assert_eq!(ctx.metrics().attempts(SERVICE), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failfast_surfaces_the_first_error() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(service());
    let cluster = MockCluster::new(endpoints(2));
    cluster.script([Outcome::Error("connection refused")]);

    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert_eq!(error.to_string(), "connection refused");
    assert_eq!(cluster.call_count(), 1);
    assert_eq!(cluster.hooks(), ["start", "error"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failsafe_swallows_errors() {
    let _trace = livemesh_tracing::test::trace_init();

    let mut policy = service();
    policy.cluster.strategy = ClusterStrategy::Failsafe;
    let ctx = context(policy);
    let cluster = MockCluster::new(endpoints(2));
    cluster.script([Outcome::Error("connection refused")]);

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(matches!(rsp, MockResponse::Empty), "{rsp:?}");
    assert_eq!(cluster.call_count(), 1);

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unready_calls_are_rejected() {
    let _trace = livemesh_tracing::test::trace_init();

    let readiness = Arc::new(Readiness::new(false));
    let ctx = context_with(service(), |b| b.status(readiness.clone()));
    let cluster = MockCluster::new(endpoints(2));

    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(error.is::<RejectUnready>(), "{error}");
    assert_eq!(cluster.call_count(), 0);

    readiness.set_ready(true);
    readiness.set_outbound(false);
    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(error.is::<RejectUnready>(), "{error}");

    readiness.set_outbound(true);
    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn hook_failures_do_not_mask_outcomes() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(service());
    let cluster = MockCluster::new(endpoints(1));
    cluster.set_failing_hooks(true);

    let rsp = invoke(&ctx, &cluster, MockRequest::default()).await;
    assert!(rsp.is_ok(), "{rsp:?}");

    cluster.script([Outcome::Error("reset")]);
    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert_eq!(error.to_string(), "reset");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn no_endpoints() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(service());
    let cluster = MockCluster::new(vec![]);

    let error = invoke(&ctx, &cluster, MockRequest::default())
        .await
        .into_error();
    assert!(error.is::<NoProvider>(), "{error}");
    assert_eq!(
        ctx.metrics()
            .rejections(SERVICE, crate::errors::FaultType::NoProvider),
        1
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unknown_services_use_defaults() {
    let _trace = livemesh_tracing::test::trace_init();

    let ctx = context(service());
    let cluster = MockCluster::new(endpoints(1));

    let rsp = invoke(&ctx, &cluster, MockRequest::new("inventory")).await;
    assert!(rsp.is_ok(), "{rsp:?}");
}
