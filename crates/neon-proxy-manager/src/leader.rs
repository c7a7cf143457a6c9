//! Leader election over the config store's lock primitive.
//!
//! Only the holder of [`keys::LEADER_LOCK_KEY`] generates and publishes
//! configuration. Acquisition retries forever with a fixed delay; the only
//! way out without the lock is a shutdown request.

use std::sync::Arc;
use std::time::Duration;

use neon_proxy::keys;
use neon_store::{ConfigStore, LockHandle, StoreResult};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Competes for the leader lock on behalf of one manager instance.
pub struct LeaderCoordinator {
    store: Arc<dyn ConfigStore>,
    key: String,
    holder: String,
    ttl: Duration,
    retry_delay: Duration,
}

impl LeaderCoordinator {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        holder: impl Into<String>,
        ttl: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            key: keys::LEADER_LOCK_KEY.to_string(),
            holder: holder.into(),
            ttl,
            retry_delay,
        }
    }

    /// One acquisition attempt. `None` means another instance holds the lock.
    pub async fn try_acquire(&self) -> StoreResult<Option<LockHandle>> {
        let lease = self
            .store
            .try_acquire_lock(&self.key, &self.holder, self.ttl)
            .await?;
        Ok(lease.map(|lease| LockHandle::start(Arc::clone(&self.store), lease)))
    }

    /// Wait until the lock is held.
    ///
    /// Returns `None` only when `shutdown` fires first. Store errors are
    /// logged and retried.
    pub async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> Option<LockHandle> {
        let mut attempts: u64 = 0;
        loop {
            if *shutdown.borrow() {
                return None;
            }

            attempts += 1;
            match self.try_acquire().await {
                Ok(Some(handle)) => {
                    info!(
                        key = %self.key,
                        holder = %self.holder,
                        session = %handle.lease().session,
                        attempts,
                        "acquired leadership"
                    );
                    return Some(handle);
                }
                Ok(None) => {
                    debug!(key = %self.key, holder = %self.holder, "leader lock held elsewhere");
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "leader lock attempt failed, will retry");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }
}
