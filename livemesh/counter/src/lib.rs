//! Per-endpoint request accounting.
//!
//! Every endpoint that receives calls has a [`Counter`] that tracks how many
//! calls are in flight along with cumulative outcomes. Admission is granted by
//! [`Counter::begin`], which hands out a [`Permit`]; the permit must be
//! completed exactly once, and dropping it unfinished records a failure.

#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

mod counter;
mod registry;

pub use self::{
    counter::{Counter, Permit, Snapshot},
    registry::{CounterRegistry, ServiceCounter},
};
