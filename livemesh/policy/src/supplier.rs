use crate::{GovernancePolicy, InvalidPolicy, ServicePolicy};
use std::sync::Arc;
use tokio::sync::watch;

/// Provides the current governance policy.
///
/// Implementations must be cheap to query since the policy is read for every
/// call.
pub trait PolicySupplier: Send + Sync + 'static {
    fn policy(&self) -> Arc<GovernancePolicy>;

    fn service(&self, name: &str) -> Option<Arc<ServicePolicy>> {
        self.policy().service(name).cloned()
    }
}

/// A [`PolicySupplier`] backed by a watch channel.
#[derive(Clone, Debug)]
pub struct WatchPolicySupplier {
    rx: watch::Receiver<Arc<GovernancePolicy>>,
}

/// Publishes policy updates to a [`WatchPolicySupplier`].
#[derive(Debug)]
pub struct Updater {
    tx: watch::Sender<Arc<GovernancePolicy>>,
}

// === impl WatchPolicySupplier ===

impl WatchPolicySupplier {
    pub fn channel(initial: GovernancePolicy) -> (Updater, Self) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (Updater { tx }, Self { rx })
    }

    /// Returns a supplier that never changes.
    pub fn fixed(policy: GovernancePolicy) -> Self {
        let (_, rx) = watch::channel(Arc::new(policy));
        Self { rx }
    }

    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl PolicySupplier for WatchPolicySupplier {
    fn policy(&self) -> Arc<GovernancePolicy> {
        self.rx.borrow().clone()
    }
}

// === impl Updater ===

impl Updater {
    /// Publishes `policy` if it is valid and newer than the current policy.
    ///
    /// Returns false when the policy is stale.
    pub fn update(&self, policy: GovernancePolicy) -> Result<bool, InvalidPolicy> {
        policy.validate()?;
        let version = policy.version();
        let policy = Arc::new(policy);
        let published = self.tx.send_if_modified(|current| {
            if version <= current.version() {
                return false;
            }
            *current = policy;
            true
        });
        if published {
            tracing::info!(version, "Updated governance policy");
        } else {
            tracing::debug!(version, "Ignoring stale governance policy");
        }
        Ok(published)
    }
}
