use livemesh_error::Error;
use tracing::trace;
use tracing_subscriber::{filter::Builder, reload, EnvFilter, Registry};

#[derive(Clone)]
pub struct Handle(reload::Handle<EnvFilter, Registry>);

pub(crate) fn filter_builder() -> Builder {
    EnvFilter::builder().with_regex(false)
}

impl Handle {
    pub(crate) fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self(handle)
    }

    pub fn set_level(&self, level: impl AsRef<str>) -> Result<(), Error> {
        let level = level.as_ref();
        trace!(%level, "parsing log level");
        let filter = filter_builder().parse(level)?;
        self.0.reload(filter)?;
        tracing::info!(%level, "set new log level");
        Ok(())
    }

    pub fn current(&self) -> Result<String, Error> {
        self.0
            .with_current(|f| f.to_string())
            .map_err(Into::into)
    }
}
