//! Held distributed locks and their session renewal.
//!
//! A [`LockHandle`] owns a [`Lease`] plus a background task that renews the
//! session every `ttl / 3`. The handle reports loss of the session without
//! blocking ([`LockHandle::is_held`]) and as a future ([`LockHandle::lost`]).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::traits::{ConfigStore, Lease};

/// Lower bound on the renewal period for very short test TTLs.
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// A lock held by this process.
///
/// Dropping the handle stops renewals without releasing the lease, so the
/// lock stays taken until its TTL runs out. Call [`LockHandle::release`] to
/// hand it over immediately.
pub struct LockHandle {
    store: Arc<dyn ConfigStore>,
    lease: Lease,
    held: watch::Receiver<bool>,
    renewal: Option<JoinHandle<()>>,
}

impl LockHandle {
    /// Wrap a freshly granted lease and start renewing it.
    pub fn start(store: Arc<dyn ConfigStore>, lease: Lease) -> Self {
        let (held_tx, held_rx) = watch::channel(true);
        let renewal = tokio::spawn(renew_loop(Arc::clone(&store), lease.clone(), held_tx));

        Self {
            store,
            lease,
            held: held_rx,
            renewal: Some(renewal),
        }
    }

    /// The underlying lease.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Whether the session is still believed to be alive. Never blocks.
    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    /// Resolves once the session has been lost.
    pub async fn lost(&self) {
        let mut held = self.held.clone();
        // A closed channel means the renewal task is gone, which is a loss too.
        let _ = held.wait_for(|held| !*held).await;
    }

    /// A cloneable view of the session state for tasks that must stop
    /// working once the lock is gone.
    pub fn guard(&self) -> LeaseGuard {
        LeaseGuard {
            held: self.held.clone(),
        }
    }

    /// Stop renewing and give the lock back.
    pub async fn release(mut self) -> StoreResult<bool> {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
            // Wait for the task to drop its sender so guards see the release.
            let _ = renewal.await;
        }
        let released = self.store.release_lock(&self.lease).await?;
        info!(key = %self.lease.key, holder = %self.lease.holder, released, "lock released");
        Ok(released)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

/// Observes a [`LockHandle`]'s session without owning the lock.
#[derive(Clone)]
pub struct LeaseGuard {
    held: watch::Receiver<bool>,
}

impl LeaseGuard {
    /// False once the session is lost or the handle was released or dropped.
    pub fn is_held(&self) -> bool {
        // A closed channel means the renewal task is gone.
        self.held.has_changed().is_ok() && *self.held.borrow()
    }

    /// Resolves once the session has been lost or the handle is gone.
    pub async fn lost(&self) {
        let mut held = self.held.clone();
        let _ = held.wait_for(|held| !*held).await;
    }
}

/// Renewal period for a session TTL.
pub fn renew_period(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEW_PERIOD)
}

async fn renew_loop(store: Arc<dyn ConfigStore>, lease: Lease, held: watch::Sender<bool>) {
    let mut interval = tokio::time::interval(renew_period(lease.ttl));
    // The first tick completes immediately; the lease is fresh.
    interval.tick().await;
    let mut last_renewed = Instant::now();

    loop {
        interval.tick().await;
        match store.renew_lock(&lease).await {
            Ok(true) => {
                last_renewed = Instant::now();
                debug!(key = %lease.key, "lock session renewed");
            }
            Ok(false) => {
                warn!(key = %lease.key, holder = %lease.holder, "lock session lost");
                break;
            }
            Err(e) => {
                if last_renewed.elapsed() >= lease.ttl {
                    warn!(key = %lease.key, error = %e, "lock session expired while the store was unreachable");
                    break;
                }
                warn!(key = %lease.key, error = %e, "lock renewal failed, retrying");
            }
        }
    }

    let _ = held.send(false);
}
