//! Client interfaces for the two cluster collaborators.
//!
//! The manager only ever talks to the config store and the secret store
//! through these traits, so production clients and the embedded
//! [`ClusterStore`](crate::ClusterStore) are interchangeable.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

use crate::error::StoreResult;

/// A lease on a distributed lock, as granted by the config store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lock path.
    pub key: String,
    /// Identity of the instance holding the lock.
    pub holder: String,
    /// Session identifier; renewals must present the same session.
    pub session: String,
    /// Session time-to-live. Unrenewed sessions expire after this long.
    pub ttl: Duration,
}

/// Outcome of waiting on a [`KeyWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// At least one key under the watched prefix was written or deleted.
    Changed,
    /// Nothing changed before the timeout elapsed.
    TimedOut,
    /// The store went away; no further notifications will arrive.
    Closed,
}

/// Typed key/value access to the distributed config store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a key. Returns `None` when the key does not exist.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a key. Returns `true` once the write is committed.
    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<bool>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// List every entry whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Write all entries atomically: either every key is written or none is.
    async fn transactional_write(&self, entries: &[(String, Vec<u8>)]) -> StoreResult<bool>;

    /// Subscribe to changes under `prefix`.
    ///
    /// The subscription starts immediately, so changes made between this
    /// call and the first [`KeyWatcher::changed`] are not lost.
    fn watch(&self, prefix: &str) -> KeyWatcher;

    /// Try to take the lock at `key` without blocking.
    ///
    /// Returns `None` when another live session holds it.
    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<Option<Lease>>;

    /// Extend a lease by its TTL. Returns `false` if the session was lost.
    async fn renew_lock(&self, lease: &Lease) -> StoreResult<bool>;

    /// Release a lease. Returns `false` if the session was already gone.
    async fn release_lock(&self, lease: &Lease) -> StoreResult<bool>;
}

/// Read-only access to the secret-management service.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// List secret names directly under `prefix` (relative, sorted).
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Read a secret document. Returns `None` when the path does not exist.
    async fn read(&self, path: &str) -> StoreResult<Option<serde_json::Value>>;
}

/// A subscription to key changes under a prefix.
///
/// Fed by a broadcast channel of changed keys. Bursts of changes are
/// coalesced into a single [`WatchEvent::Changed`].
pub struct KeyWatcher {
    prefix: String,
    rx: broadcast::Receiver<String>,
}

impl KeyWatcher {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<String>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Wait until a key under the prefix changes or `timeout` elapses.
    pub async fn changed(&mut self, timeout: Duration) -> WatchEvent {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return WatchEvent::TimedOut,
                received = self.rx.recv() => match received {
                    Ok(key) if key.starts_with(&self.prefix) => {
                        self.drain_pending();
                        return WatchEvent::Changed;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        // Dropped notifications may have touched our prefix.
                        debug!(prefix = %self.prefix, skipped, "watcher lagged");
                        self.drain_pending();
                        return WatchEvent::Changed;
                    }
                    Err(RecvError::Closed) => return WatchEvent::Closed,
                },
            }
        }
    }

    /// Discard notifications that are already queued. Returns how many
    /// of them touched the watched prefix.
    pub fn drain_pending(&mut self) -> usize {
        let mut relevant = 0;
        loop {
            match self.rx.try_recv() {
                Ok(key) => {
                    if key.starts_with(&self.prefix) {
                        relevant += 1;
                    }
                }
                Err(TryRecvError::Lagged(_)) => relevant += 1,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        relevant
    }
}
