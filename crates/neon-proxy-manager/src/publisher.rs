//! Publishing bundles to the config store.

use neon_proxy::keys;
use neon_store::{ConfigStore, StoreError};
use tracing::info;

use crate::change::ChangeDetector;
use crate::error::{CycleError, CycleResult};

/// What a publish attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Unchanged,
}

/// Writes a proxy's hash and bundle together, or not at all.
pub struct Publisher<'a> {
    store: &'a dyn ConfigStore,
}

impl<'a> Publisher<'a> {
    pub fn new(store: &'a dyn ConfigStore) -> Self {
        Self { store }
    }

    /// Publish unless the store already holds `hash` for this proxy.
    pub async fn publish(
        &self,
        proxy: &str,
        hash: &str,
        bundle: &[u8],
    ) -> CycleResult<PublishOutcome> {
        if !ChangeDetector::new(self.store).has_changed(proxy, hash).await? {
            info!(proxy = %proxy, hash = %hash, "no changes detected");
            return Ok(PublishOutcome::Unchanged);
        }

        let entries = vec![
            (keys::published_hash_key(proxy), hash.as_bytes().to_vec()),
            (keys::published_bundle_key(proxy), bundle.to_vec()),
        ];
        if !self.store.transactional_write(&entries).await? {
            return Err(CycleError::Store(StoreError::Transaction(format!(
                "publish transaction for proxy [{proxy}] was not applied"
            ))));
        }

        info!(proxy = %proxy, hash = %hash, bytes = bundle.len(), "published proxy config");
        Ok(PublishOutcome::Published)
    }
}
