#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

mod endpoint;
mod target;

pub use self::{
    endpoint::{Endpoint, EndpointState, LABEL_LANE},
    target::RouteTarget,
};
