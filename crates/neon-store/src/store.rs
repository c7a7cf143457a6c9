//! ClusterStore: redb-backed config store, lock service, and secret vault.
//!
//! Serves as the embedded stand-in for the cluster's Raft-backed key/value
//! store and its secret-management service. Config values are raw bytes,
//! lease records and secrets are JSON. Every committed config write or
//! delete is broadcast to [`KeyWatcher`]s. The store supports both on-disk
//! and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;
use crate::traits::{ConfigStore, KeyWatcher, Lease, SecretStore};

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Persisted state of a lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct LeaseRecord {
    holder: String,
    session: String,
    expires_at_ms: u64,
}

/// Thread-safe cluster store backed by redb.
#[derive(Clone)]
pub struct ClusterStore {
    db: Arc<Database>,
    changes: broadcast::Sender<String>,
    sessions: Arc<AtomicU64>,
}

impl ClusterStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "cluster store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory cluster store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StoreResult<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            changes,
            sessions: Arc::new(AtomicU64::new(0)),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn notify(&self, key: &str) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.changes.send(key.to_string());
    }

    // ── Config entries ─────────────────────────────────────────────

    /// Read a config entry.
    pub fn get_value(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// Insert or replace a config entry.
    pub fn put_value(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.write_entries(&[(key.to_string(), value.to_vec())])
    }

    /// Delete a config entry. Returns true if it existed.
    pub fn delete_value(&self, key: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            self.notify(key);
        }
        debug!(%key, existed, "config entry deleted");
        Ok(existed)
    }

    /// List every config entry under a prefix, in key order.
    pub fn list_values(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push((key.value().to_string(), value.value().to_vec()));
            }
        }
        Ok(results)
    }

    /// Write several entries in one transaction.
    pub fn write_entries(&self, entries: &[(String, Vec<u8>)]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            for (key, value) in entries {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        for (key, _) in entries {
            self.notify(key);
        }
        debug!(count = entries.len(), "config entries written");
        Ok(())
    }

    // ── Locks ──────────────────────────────────────────────────────

    fn next_session(&self, holder: &str) -> String {
        let seq = self.sessions.fetch_add(1, Ordering::Relaxed);
        format!("{holder}-{:x}-{seq}", now_ms())
    }

    /// Take the lock at `key` unless another unexpired session holds it.
    pub fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<Option<Lease>> {
        let now = now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let granted = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LeaseRecord> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };

            match current {
                Some(record) if record.expires_at_ms > now => None,
                _ => {
                    let record = LeaseRecord {
                        holder: holder.to_string(),
                        session: self.next_session(holder),
                        expires_at_ms: now + ttl.as_millis() as u64,
                    };
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(Lease {
                        key: key.to_string(),
                        holder: holder.to_string(),
                        session: record.session,
                        ttl,
                    })
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %holder, granted = granted.is_some(), "lock acquisition attempted");
        Ok(granted)
    }

    /// Extend an unexpired lease held by the same session.
    pub fn renew_lease(&self, lease: &Lease) -> StoreResult<bool> {
        let now = now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LeaseRecord> = match table.get(lease.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
                None => None,
            };

            match current {
                Some(mut record) if record.session == lease.session && record.expires_at_ms > now => {
                    record.expires_at_ms = now + lease.ttl.as_millis() as u64;
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table
                        .insert(lease.key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(renewed)
    }

    /// Remove a lease if it still belongs to the given session.
    pub fn release_lease(&self, lease: &Lease) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let owned = match table.get(lease.key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let record: LeaseRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    record.session == lease.session
                }
                None => false,
            };
            if owned {
                table.remove(lease.key.as_str()).map_err(map_err!(Write))?;
            }
            owned
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    /// Drop every session, as a store restart would.
    pub fn invalidate_sessions(&self) -> StoreResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    Some(key.value().to_string())
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = keys.len(), "lock sessions invalidated");
        Ok(keys.len() as u32)
    }

    // ── Secrets ────────────────────────────────────────────────────

    /// Store a secret document.
    pub fn put_secret(&self, path: &str, document: &serde_json::Value) -> StoreResult<()> {
        let value = serde_json::to_vec(document).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            table
                .insert(path, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, "secret stored");
        Ok(())
    }

    /// Read a secret document.
    pub fn get_secret(&self, path: &str) -> StoreResult<Option<serde_json::Value>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        match table.get(path).map_err(map_err!(Read))? {
            Some(guard) => {
                let document = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    /// Names of the secrets stored directly under a prefix.
    pub fn list_secret_names(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        let mut names = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some(name) = key.value().strip_prefix(prefix)
                && !name.is_empty()
                && !name.contains('/')
            {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl ConfigStore for ClusterStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_value(key)
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        self.put_value(key, value)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.delete_value(key)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.list_values(prefix)
    }

    async fn transactional_write(&self, entries: &[(String, Vec<u8>)]) -> StoreResult<bool> {
        self.write_entries(entries)?;
        Ok(true)
    }

    fn watch(&self, prefix: &str) -> KeyWatcher {
        KeyWatcher::new(prefix, self.changes.subscribe())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<Option<Lease>> {
        self.acquire_lock(key, holder, ttl)
    }

    async fn renew_lock(&self, lease: &Lease) -> StoreResult<bool> {
        self.renew_lease(lease)
    }

    async fn release_lock(&self, lease: &Lease) -> StoreResult<bool> {
        self.release_lease(lease)
    }
}

#[async_trait]
impl SecretStore for ClusterStore {
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.list_secret_names(prefix)
    }

    async fn read(&self, path: &str) -> StoreResult<Option<serde_json::Value>> {
        self.get_secret(path)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::WatchEvent;

    // ── Config entries ─────────────────────────────────────────────

    #[test]
    fn value_put_and_get() {
        let store = ClusterStore::open_in_memory().unwrap();
        store.put_value("conf/a", b"one").unwrap();

        assert_eq!(store.get_value("conf/a").unwrap(), Some(b"one".to_vec()));
    }

    #[test]
    fn value_get_nonexistent_returns_none() {
        let store = ClusterStore::open_in_memory().unwrap();
        assert!(store.get_value("nope").unwrap().is_none());
    }

    #[test]
    fn list_values_filters_by_prefix_in_key_order() {
        let store = ClusterStore::open_in_memory().unwrap();
        store.put_value("conf/routes/b", b"2").unwrap();
        store.put_value("conf/routes/a", b"1").unwrap();
        store.put_value("conf/settings", b"s").unwrap();

        let routes = store.list_values("conf/routes/").unwrap();
        let keys: Vec<&str> = routes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["conf/routes/a", "conf/routes/b"]);
    }

    #[test]
    fn delete_value_reports_existence() {
        let store = ClusterStore::open_in_memory().unwrap();
        store.put_value("conf/a", b"1").unwrap();

        assert!(store.delete_value("conf/a").unwrap());
        assert!(!store.delete_value("conf/a").unwrap());
    }

    #[tokio::test]
    async fn transactional_write_commits_every_entry() {
        let store = ClusterStore::open_in_memory().unwrap();
        let entries = vec![
            ("out/hash".to_string(), b"abc".to_vec()),
            ("out/conf".to_string(), b"bundle".to_vec()),
        ];

        assert!(store.transactional_write(&entries).await.unwrap());
        assert_eq!(store.get("out/hash").await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.get("out/conf").await.unwrap(), Some(b"bundle".to_vec()));
    }

    // ── Watches ────────────────────────────────────────────────────

    #[tokio::test]
    async fn watcher_sees_changes_under_prefix() {
        let store = ClusterStore::open_in_memory().unwrap();
        let mut watcher = store.watch("conf/");

        store.put_value("conf/a", b"1").unwrap();
        store.put_value("conf/b", b"2").unwrap();

        assert_eq!(watcher.changed(Duration::from_secs(1)).await, WatchEvent::Changed);
        // Both writes were coalesced into the first event.
        assert_eq!(
            watcher.changed(Duration::from_millis(20)).await,
            WatchEvent::TimedOut
        );
    }

    #[tokio::test]
    async fn watcher_ignores_other_prefixes() {
        let store = ClusterStore::open_in_memory().unwrap();
        let mut watcher = store.watch("conf/");

        store.put_value("status/a", b"1").unwrap();

        assert_eq!(
            watcher.changed(Duration::from_millis(30)).await,
            WatchEvent::TimedOut
        );
    }

    #[tokio::test]
    async fn watcher_sees_deletes() {
        let store = ClusterStore::open_in_memory().unwrap();
        store.put_value("conf/a", b"1").unwrap();
        let mut watcher = store.watch("conf/");

        store.delete_value("conf/a").unwrap();

        assert_eq!(watcher.changed(Duration::from_secs(1)).await, WatchEvent::Changed);
    }

    // ── Locks ──────────────────────────────────────────────────────

    #[test]
    fn lock_is_exclusive_until_expiry() {
        let store = ClusterStore::open_in_memory().unwrap();
        let ttl = Duration::from_millis(50);

        let first = store.acquire_lock("leader", "a", ttl).unwrap();
        assert!(first.is_some());
        assert!(store.acquire_lock("leader", "b", ttl).unwrap().is_none());

        std::thread::sleep(Duration::from_millis(80));
        let second = store.acquire_lock("leader", "b", ttl).unwrap().unwrap();
        assert_eq!(second.holder, "b");

        // The expired session can no longer renew.
        assert!(!store.renew_lease(&first.unwrap()).unwrap());
    }

    #[test]
    fn renew_extends_and_release_frees() {
        let store = ClusterStore::open_in_memory().unwrap();
        let lease = store
            .acquire_lock("leader", "a", Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert!(store.renew_lease(&lease).unwrap());
        assert!(store.release_lease(&lease).unwrap());
        assert!(!store.release_lease(&lease).unwrap());
        assert!(store.acquire_lock("leader", "b", Duration::from_secs(10)).unwrap().is_some());
    }

    #[test]
    fn invalidated_sessions_cannot_renew() {
        let store = ClusterStore::open_in_memory().unwrap();
        let lease = store
            .acquire_lock("leader", "a", Duration::from_secs(10))
            .unwrap()
            .unwrap();

        assert_eq!(store.invalidate_sessions().unwrap(), 1);
        assert!(!store.renew_lease(&lease).unwrap());
    }

    // ── Secrets ────────────────────────────────────────────────────

    #[tokio::test]
    async fn secrets_list_direct_children_only() {
        let store = ClusterStore::open_in_memory().unwrap();
        let doc = serde_json::json!({ "cert": "c" });
        store.put_secret("neon-secret/cert/b", &doc).unwrap();
        store.put_secret("neon-secret/cert/a", &doc).unwrap();
        store.put_secret("neon-secret/cert/nested/x", &doc).unwrap();
        store.put_secret("neon-secret/other", &doc).unwrap();

        let names = SecretStore::list(&store, "neon-secret/cert/").await.unwrap();
        assert_eq!(names, vec!["a", "b"]);

        let read = SecretStore::read(&store, "neon-secret/cert/a").await.unwrap();
        assert_eq!(read, Some(doc));
        assert!(SecretStore::read(&store, "neon-secret/cert/zz").await.unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cluster.redb");

        {
            let store = ClusterStore::open(&db_path).unwrap();
            store.put_value("conf/a", b"kept").unwrap();
        }

        let store = ClusterStore::open(&db_path).unwrap();
        assert_eq!(store.get_value("conf/a").unwrap(), Some(b"kept".to_vec()));
    }
}
