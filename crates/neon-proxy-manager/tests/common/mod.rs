//! Shared fixtures for the manager's integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use neon_proxy::keys;
use neon_proxy_manager::{ConfigGenerator, ManagerConfig, ProxyManager, RunOptions};
use neon_store::{
    ClusterStore, ConfigStore, KeyWatcher, Lease, LockHandle, SecretStore, StoreResult,
};
use rcgen::{CertificateParams, KeyPair, date_time_ymd};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Far enough out that fixtures never expire.
pub const EXPIRES_YEAR: i32 = 2040;

pub fn store() -> ClusterStore {
    ClusterStore::open_in_memory().unwrap()
}

/// Self-signed leaf for `hosts`, valid from 2020 until January of `expires_year`.
pub fn pem_pair(hosts: &[&str], expires_year: i32) -> (String, String) {
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let mut params = CertificateParams::new(names).unwrap();
    params.not_before = date_time_ymd(2020, 1, 1);
    params.not_after = date_time_ymd(expires_year, 1, 1);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Store a freshly issued certificate; every call yields new key material.
pub fn put_cert(store: &ClusterStore, name: &str, hosts: &[&str], expires_year: i32) {
    let (cert, key) = pem_pair(hosts, expires_year);
    let document = json!({ "cert": cert, "key": key, "hosts": hosts });
    store
        .put_secret(&keys::cert_secret_path(name), &document)
        .unwrap();
}

pub fn put_route(store: &ClusterStore, proxy: &str, route: Value) {
    let name = route["name"].as_str().unwrap().to_string();
    store
        .put_value(&keys::route_key(proxy, &name), route.to_string().as_bytes())
        .unwrap();
}

pub fn tls_route(name: &str, host: &str, port: u16, cert: &str, backend_port: u16) -> Value {
    json!({
        "mode": "http",
        "name": name,
        "frontends": [{ "host": host, "port": port, "tls": true, "cert_name": cert }],
        "backends": [{ "server": "10.0.0.5", "port": backend_port }],
    })
}

pub fn plain_route(name: &str, host: &str, port: u16) -> Value {
    json!({
        "mode": "http",
        "name": name,
        "frontends": [{ "host": host, "port": port }],
        "backends": [{ "server": "10.0.0.7", "port": 8080 }],
    })
}

/// The `public`/`web`/`site-cert` scenario.
pub fn site_scenario(store: &ClusterStore) {
    put_cert(store, "site-cert", &["site.example.com"], EXPIRES_YEAR);
    put_route(store, "public", tls_route("web", "site.example.com", 443, "site-cert", 8080));
}

pub fn generator(config: Arc<dyn ConfigStore>, store: &ClusterStore, settings: ManagerConfig) -> ConfigGenerator {
    ConfigGenerator::new(config, Arc::new(store.clone()), settings)
}

pub async fn lead(store: Arc<dyn ConfigStore>, holder: &str) -> LockHandle {
    let lease = store
        .try_acquire_lock(keys::LEADER_LOCK_KEY, holder, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    LockHandle::start(store, lease)
}

/// Fast timings for running whole managers against the `public` proxy.
pub fn run_options(instance: &str) -> RunOptions {
    RunOptions {
        instance_id: instance.to_string(),
        proxies: vec!["public".to_string()],
        lock_retry: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(1),
        debounce: Duration::from_millis(20),
    }
}

/// Run a manager in the background. The task yields whether `run` ended
/// without error; sending `true` on the sender shuts it down.
pub fn spawn_manager_with(
    store: &ClusterStore,
    secrets: Arc<dyn SecretStore>,
    options: RunOptions,
) -> (JoinHandle<bool>, watch::Sender<bool>) {
    let manager = ProxyManager::new(Arc::new(store.clone()), secrets, options);
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { manager.run(rx).await.is_ok() });
    (task, tx)
}

pub fn spawn_manager(store: &ClusterStore, instance: &str) -> (JoinHandle<bool>, watch::Sender<bool>) {
    spawn_manager_with(store, Arc::new(store.clone()), run_options(instance))
}

pub fn published_hash(store: &ClusterStore, proxy: &str) -> Option<String> {
    store
        .get_value(&keys::published_hash_key(proxy))
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

/// Wait until `condition` holds, failing the test after `limit`.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, condition: F) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A [`ConfigStore`] that counts transactional writes.
pub struct CountingStore {
    inner: ClusterStore,
    transactions: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: ClusterStore) -> Self {
        Self {
            inner,
            transactions: AtomicUsize::new(0),
        }
    }

    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for CountingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        ConfigStore::get(&self.inner, key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        ConfigStore::list(&self.inner, prefix).await
    }

    async fn transactional_write(&self, entries: &[(String, Vec<u8>)]) -> StoreResult<bool> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        self.inner.transactional_write(entries).await
    }

    fn watch(&self, prefix: &str) -> KeyWatcher {
        self.inner.watch(prefix)
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> StoreResult<Option<Lease>> {
        self.inner.try_acquire_lock(key, holder, ttl).await
    }

    async fn renew_lock(&self, lease: &Lease) -> StoreResult<bool> {
        self.inner.renew_lock(lease).await
    }

    async fn release_lock(&self, lease: &Lease) -> StoreResult<bool> {
        self.inner.release_lock(lease).await
    }
}
