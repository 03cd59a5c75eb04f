//! The errors produced while governing an outbound call.

use livemesh_error::Error;
use livemesh_rate_limit::RateLimited;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

/// Marks an error that must never be retried.
#[derive(Debug, Error)]
#[error("unretryable: {source}")]
pub struct Unretryable {
    #[source]
    source: Error,
}

#[derive(Debug, Error)]
#[error("retries exhausted after {attempts} attempts")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub source: Option<Error>,
}

#[derive(Debug, Error)]
#[error("retry deadline exceeded after {attempts} attempts in {elapsed:?}")]
pub struct RetryTimeout {
    pub attempts: u32,
    pub elapsed: Duration,
    #[source]
    pub source: Option<Error>,
}

/// The retry executor dropped a scheduled attempt without running it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("retry abandoned after {attempts} attempts")]
pub struct RetryAbandoned {
    pub attempts: u32,
}

#[derive(Debug, Error)]
#[error("outbound calls to {service} are not ready")]
pub struct RejectUnready {
    pub service: Arc<str>,
}

#[derive(Debug, Error)]
#[error("circuit breaker {policy} is open for {resource}")]
pub struct CircuitBreak {
    pub policy: u64,
    pub resource: Arc<str>,
}

#[derive(Debug, Error)]
pub enum RejectLimit {
    #[error("endpoint {endpoint} has {max_active} calls in flight")]
    Concurrency {
        endpoint: Arc<str>,
        max_active: usize,
    },

    #[error(transparent)]
    Rate(#[from] RateLimited),
}

#[derive(Debug, Error)]
#[error("fault injected by policy {policy}: {code} {message}")]
pub struct FaultInjected {
    pub policy: u64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("call to {service} requires authentication")]
pub struct RejectAuth {
    pub service: Arc<str>,
}

#[derive(Debug, Error)]
#[error("no endpoint available for {service}")]
pub struct NoProvider {
    pub service: Arc<str>,
}

/// A post-selection filter refused the chosen endpoint. The load balancer
/// reacts by choosing another candidate.
#[derive(Debug, Error)]
#[error("endpoint {endpoint} rejected: {reason}")]
pub struct EndpointRejected {
    pub endpoint: Arc<str>,
    #[source]
    pub reason: Error,
}

/// The chosen endpoint does not carry the labels required by a tag route.
#[derive(Debug, Error)]
#[error("endpoint does not satisfy tag route {route}")]
pub struct TagMismatch {
    pub route: u64,
}

/// Identifies why an outbound call was rejected or failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FaultType {
    Unretryable,
    RetryExhausted,
    RetryTimeout,
    Unready,
    CircuitBreak,
    Limit,
    Fault,
    Auth,
    NoProvider,
}

/// A normalized description of a failed call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorCause {
    /// A response code, such as an HTTP status or RPC code.
    pub code: Option<String>,
    /// The kind of error, matched against policies' error kinds.
    pub kind: Option<String>,
}

/// Translates framework-specific responses and errors into [`ErrorCause`]s.
pub trait ErrorParser<R>: Send + Sync + 'static {
    fn parse_error(&self, error: &Error) -> ErrorCause;

    /// Returns `None` when the response indicates success.
    fn parse_response(&self, rsp: &R) -> Option<ErrorCause>;
}

/// Classifies errors by their [`FaultType`] and responses by their code.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultErrorParser;

// === impl Unretryable ===

impl Unretryable {
    pub fn new(source: impl Into<Error>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

// === impl EndpointRejected ===

impl EndpointRejected {
    pub fn new(endpoint: Arc<str>, reason: impl Into<Error>) -> Self {
        Self {
            endpoint,
            reason: reason.into(),
        }
    }

    /// Unwraps the rejection reason if `error` is a rejection.
    pub(crate) fn into_reason(error: Error) -> Error {
        match error.downcast::<Self>() {
            Ok(rejected) => rejected.reason,
            Err(error) => error,
        }
    }
}

// === impl FaultType ===

impl FaultType {
    /// Classifies `error` by the first cause in its chain that has a fault
    /// type. Rejections are transparent.
    pub fn of(error: &(dyn std::error::Error + 'static)) -> Option<Self> {
        livemesh_error::causes(error).find_map(Self::classify)
    }

    fn classify(error: &(dyn std::error::Error + 'static)) -> Option<Self> {
        if error.is::<Unretryable>() {
            return Some(Self::Unretryable);
        }
        if error.is::<RetryExhausted>() {
            return Some(Self::RetryExhausted);
        }
        if error.is::<RetryTimeout>() || error.is::<RetryAbandoned>() {
            return Some(Self::RetryTimeout);
        }
        if error.is::<RejectUnready>() {
            return Some(Self::Unready);
        }
        if error.is::<CircuitBreak>() {
            return Some(Self::CircuitBreak);
        }
        if error.is::<RejectLimit>() {
            return Some(Self::Limit);
        }
        if error.is::<FaultInjected>() {
            return Some(Self::Fault);
        }
        if error.is::<RejectAuth>() {
            return Some(Self::Auth);
        }
        if error.is::<NoProvider>() {
            return Some(Self::NoProvider);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unretryable => "unretryable",
            Self::RetryExhausted => "retry_exhausted",
            Self::RetryTimeout => "retry_timeout",
            Self::Unready => "unready",
            Self::CircuitBreak => "circuit_break",
            Self::Limit => "limit",
            Self::Fault => "fault",
            Self::Auth => "auth",
            Self::NoProvider => "no_provider",
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true for errors that must not be retried.
pub fn is_unretryable(error: &(dyn std::error::Error + 'static)) -> bool {
    matches!(
        FaultType::of(error),
        Some(FaultType::Unretryable | FaultType::Unready | FaultType::Auth)
    )
}

/// Returns true for rejections that happened before the call reached an
/// endpoint.
pub(crate) fn is_local_rejection(error: &(dyn std::error::Error + 'static)) -> bool {
    error.is::<EndpointRejected>() || error.is::<RejectLimit>()
}

// === impl DefaultErrorParser ===

impl DefaultErrorParser {
    fn cause(error: &Error) -> ErrorCause {
        ErrorCause {
            code: None,
            kind: FaultType::of(&**error).map(|f| f.as_str().to_string()),
        }
    }
}

impl<R: crate::OutboundResponse> ErrorParser<R> for DefaultErrorParser {
    fn parse_error(&self, error: &Error) -> ErrorCause {
        Self::cause(error)
    }

    fn parse_response(&self, rsp: &R) -> Option<ErrorCause> {
        if let Some(error) = rsp.error() {
            return Some(Self::cause(error));
        }
        let code = rsp.code()?;
        Some(ErrorCause {
            code: Some(code.to_string()),
            kind: None,
        })
    }
}
