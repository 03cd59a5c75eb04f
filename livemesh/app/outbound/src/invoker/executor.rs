use crate::Config;
use futures::future::BoxFuture;
use std::{fmt, io, time::Duration};
use tokio::runtime::{self, Handle, Runtime};

/// Schedules detached retries.
pub trait RetryExecutor: Send + Sync + 'static {
    /// Runs `task` once `delay` has elapsed.
    fn submit(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Runs retries as tasks on a tokio runtime.
pub struct TokioRetryExecutor {
    handle: Handle,
    // Owned only when the executor runs its own threads.
    runtime: Option<Runtime>,
}

// === impl TokioRetryExecutor ===

impl TokioRetryExecutor {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
        }
    }

    /// Uses the current runtime unless `retry_threads` asks for dedicated
    /// threads.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        if config.retry_threads == 0 {
            let handle = Handle::try_current().map_err(io::Error::other)?;
            return Ok(Self::new(handle));
        }

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(config.retry_threads)
            .thread_name("livemesh-retry")
            .enable_time()
            .build()?;
        tracing::debug!(threads = config.retry_threads, "Started retry runtime");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }
}

impl RetryExecutor for TokioRetryExecutor {
    fn submit(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await
        });
    }
}

impl Drop for TokioRetryExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Pending retries are dropped; their callers see them abandoned.
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TokioRetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioRetryExecutor")
            .field("dedicated", &self.runtime.is_some())
            .finish()
    }
}
