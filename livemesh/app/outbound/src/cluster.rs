use crate::{
    errors::RejectUnready, OutboundInvocation, OutboundRequest, OutboundResponse,
};
use futures::future::BoxFuture;
use livemesh_error::{Error, Result};
use livemesh_policy::DegradeConfig;
use livemesh_route::Endpoint;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Invocation<C> = OutboundInvocation<<C as LiveCluster>::Request>;

/// The set of endpoints behind one logical service, and the means to call
/// them.
///
/// Invokers drive calls through this trait: they resolve candidates with
/// [`LiveCluster::route`], call a chosen endpoint with
/// [`LiveCluster::invoke`], and turn errors into responses so that every call
/// completes with a `Response`.
pub trait LiveCluster: Send + Sync + 'static {
    type Request: OutboundRequest;
    type Response: OutboundResponse;

    /// Resolves the current candidate endpoints for the invocation's service.
    fn route(&self, inv: &Invocation<Self>) -> BoxFuture<'static, Result<Vec<Endpoint>>>;

    /// Sends the request to `endpoint`.
    fn invoke(
        &self,
        inv: &Invocation<Self>,
        endpoint: &Endpoint,
    ) -> BoxFuture<'static, Result<Self::Response>>;

    /// Synthesizes a response describing `error`.
    fn create_response(&self, inv: &Invocation<Self>, error: Error) -> Self::Response;

    /// The neutral response returned when failures are swallowed.
    fn empty_response(&self, inv: &Invocation<Self>) -> Self::Response;

    /// Synthesizes the fallback response configured by a breaker.
    fn degrade(&self, inv: &Invocation<Self>, config: &DegradeConfig) -> Self::Response;

    /// The error used to reject calls while the application is not ready.
    /// When `None`, calls proceed regardless of readiness.
    fn create_unready_error(&self, inv: &Invocation<Self>) -> Option<Error> {
        Some(
            RejectUnready {
                service: inv.service().clone(),
            }
            .into(),
        )
    }

    /// Returns true once the cluster has been shut down. Destroyed clusters
    /// are not retried.
    fn is_destroyed(&self) -> bool {
        false
    }

    fn on_start(&self, _inv: &Invocation<Self>) -> Result<()> {
        Ok(())
    }

    fn on_success(&self, _inv: &Invocation<Self>, _rsp: &Self::Response) -> Result<()> {
        Ok(())
    }

    fn on_error(&self, _inv: &Invocation<Self>, _error: &Error) -> Result<()> {
        Ok(())
    }

    fn on_retry(&self, _inv: &Invocation<Self>, _attempt: u32) -> Result<()> {
        Ok(())
    }
}

/// Whether the application may currently make outbound calls.
pub trait AppStatus: Send + Sync + 'static {
    fn is_ready(&self) -> bool;

    /// Returns false while outbound traffic is suspended, e.g. during
    /// shutdown.
    fn outbound(&self) -> bool {
        true
    }
}

/// An [`AppStatus`] controlled by flags.
#[derive(Debug)]
pub struct Readiness {
    ready: AtomicBool,
    outbound: AtomicBool,
}

// === impl Readiness ===

impl Readiness {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            outbound: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn set_outbound(&self, outbound: bool) {
        self.outbound.store(outbound, Ordering::Release);
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AppStatus for Readiness {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn outbound(&self) -> bool {
        self.outbound.load(Ordering::Acquire)
    }
}
