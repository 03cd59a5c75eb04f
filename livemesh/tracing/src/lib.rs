#![deny(
    warnings,
    rust_2018_idioms,
    clippy::disallowed_methods,
    clippy::disallowed_types
)]
#![forbid(unsafe_code)]

pub mod level;

use livemesh_error::Error;
use tracing::Dispatch;
use tracing_subscriber::{
    fmt::{format, time::Uptime},
    prelude::*,
    registry::LookupSpan,
    reload, Layer,
};

pub use tracing::Subscriber;
pub use tracing_subscriber::EnvFilter;

const ENV_LOG_LEVEL: &str = "LIVEMESH_LOG";
const ENV_LOG_FORMAT: &str = "LIVEMESH_LOG_FORMAT";

const DEFAULT_LOG_LEVEL: &str = "warn,livemesh=info";
const DEFAULT_LOG_FORMAT: &str = "PLAIN";

#[derive(Debug, Default)]
#[must_use]
pub struct Settings {
    filter: String,
    format: String,
    is_test: bool,
}

#[derive(Clone)]
pub struct Handle {
    level: Option<level::Handle>,
}

pub fn init_log_compat() -> Result<(), Error> {
    tracing_log::LogTracer::init()?;
    Ok(())
}

// === impl Settings ===

impl Settings {
    /// Reads the filter from `LIVEMESH_LOG` and the format from
    /// `LIVEMESH_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            filter: var(ENV_LOG_LEVEL).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            format: var(ENV_LOG_FORMAT).unwrap_or_else(|| DEFAULT_LOG_FORMAT.to_string()),
            is_test: false,
        }
    }

    pub fn new(filter: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            format: format.into(),
            is_test: false,
        }
    }

    fn for_test(filter: String) -> Self {
        Self {
            filter,
            format: DEFAULT_LOG_FORMAT.to_string(),
            is_test: true,
        }
    }

    fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    fn mk_json<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
        S: Send + Sync,
    {
        let fmt = tracing_subscriber::fmt::format()
            .with_timer(Uptime::default())
            .with_thread_ids(!self.is_test)
            .json()
            // The span list already carries the current span.
            .with_span_list(true)
            .with_current_span(false);

        let fmt = tracing_subscriber::fmt::layer()
            .event_format(fmt)
            .fmt_fields(format::JsonFields::default());

        if self.is_test {
            Box::new(fmt.with_test_writer())
        } else {
            Box::new(fmt)
        }
    }

    fn mk_plain<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
        S: Send + Sync,
    {
        let fmt = tracing_subscriber::fmt::format()
            .with_timer(Uptime::default())
            .with_thread_ids(!self.is_test);
        let fmt = tracing_subscriber::fmt::layer().event_format(fmt);
        if self.is_test {
            Box::new(fmt.with_test_writer())
        } else {
            Box::new(fmt)
        }
    }

    /// Installs the subscriber built from these settings as the process-wide
    /// default.
    pub fn init(self) -> Result<Handle, Error> {
        if self.filter.trim().eq_ignore_ascii_case("off") {
            return Ok(Handle::disabled());
        }

        let (dispatch, handle) = self.build();
        tracing::dispatcher::set_global_default(dispatch)?;
        init_log_compat()?;
        Ok(handle)
    }

    /// Builds a dispatcher along with a handle that can change the log level
    /// at runtime.
    pub fn build(self) -> (Dispatch, Handle) {
        // Invalid directives are reported on stderr and otherwise ignored.
        let filter = level::filter_builder().parse_lossy(&self.filter);
        let (filter, level) = reload::Layer::new(filter);
        let registry = tracing_subscriber::registry().with(filter);

        let stdout = if self.is_json() {
            self.mk_json()
        } else {
            self.mk_plain()
        };
        let registry = registry.with(stdout);

        let handle = Handle {
            level: Some(level::Handle::new(level)),
        };
        (Dispatch::new(registry), handle)
    }
}

// === impl Handle ===

impl Handle {
    /// Returns a new `handle` with tracing disabled.
    pub fn disabled() -> Self {
        Self { level: None }
    }

    pub fn level(&self) -> Option<&level::Handle> {
        self.level.as_ref()
    }
}
