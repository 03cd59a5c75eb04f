//! Circuit breakers driven by failure and slow-call rates.
//!
//! A [`CircuitBreaker`] guards one resource: a whole service, or a single
//! endpoint of a service. Callers must obtain permission through
//! [`CircuitBreaker::acquire`] before each call and report its outcome
//! afterwards. [`CircuitBreaker::try_acquire`] returns a [`Permit`] that
//! releases its admission if the call is abandoned. While the breaker is closed, outcomes are aggregated in a
//! sliding window; once the failure or slow-call rate crosses its threshold
//! the breaker opens and refuses calls until `wait_in_open` elapses. It then
//! admits a limited number of trial calls whose outcomes decide whether it
//! closes again or reopens.

#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

mod breaker;
mod registry;
mod window;

pub use self::{
    breaker::{CircuitBreaker, Permit, State, StateListener, Transition},
    registry::{BreakerRegistry, BrokenInstances},
};
