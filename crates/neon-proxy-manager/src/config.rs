//! Manager configuration.
//!
//! Two layers: [`ManagerConfig`] lives in the config store itself so every
//! instance agrees on it, while [`RunOptions`] comes from the command line
//! and is local to one process.

use std::time::Duration;

use neon_proxy::keys;
use neon_store::{ConfigStore, StoreResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

const DEFAULT_LOCK_TTL_SECS: u64 = 60;
const DEFAULT_POLL_SECS: u64 = 300;
const DEFAULT_CERT_WARN_DAYS: u64 = 30;

/// Settings shared by every manager instance, stored under the manager's
/// `conf/` prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Session TTL of the leader lock.
    pub lock_ttl: Duration,
    /// Watch timeout; also the fallback resync period.
    pub poll_interval: Duration,
    /// Certificates expiring within this window are logged as warnings.
    pub cert_warn_window: Duration,
    /// Fail validation when a certificate does not cover its host.
    pub strict_cert_hosts: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            cert_warn_window: days(DEFAULT_CERT_WARN_DAYS),
            strict_cert_hosts: false,
        }
    }
}

impl ManagerConfig {
    /// Read every setting, writing defaults for the ones not yet present.
    pub async fn load(store: &dyn ConfigStore) -> StoreResult<Self> {
        Self::fetch(store, true).await
    }

    /// Read every setting without writing anything back.
    pub async fn read(store: &dyn ConfigStore) -> StoreResult<Self> {
        Self::fetch(store, false).await
    }

    async fn fetch(store: &dyn ConfigStore, init: bool) -> StoreResult<Self> {
        let lock_ttl = load_or_init(store, keys::LOCK_TTL_KEY, DEFAULT_LOCK_TTL_SECS, init).await?;
        let poll = load_or_init(store, keys::POLL_SECONDS_KEY, DEFAULT_POLL_SECS, init).await?;
        let warn_days =
            load_or_init(store, keys::CERT_WARN_DAYS_KEY, DEFAULT_CERT_WARN_DAYS, init).await?;
        let strict_cert_hosts =
            load_or_init(store, keys::STRICT_CERT_HOSTS_KEY, false, init).await?;

        Ok(Self {
            lock_ttl: Duration::from_secs(positive(keys::LOCK_TTL_KEY, lock_ttl, DEFAULT_LOCK_TTL_SECS)),
            poll_interval: Duration::from_secs(positive(keys::POLL_SECONDS_KEY, poll, DEFAULT_POLL_SECS)),
            cert_warn_window: days(warn_days),
            strict_cert_hosts,
        })
    }
}

/// Process-local options from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Identifies this process as a lock holder.
    pub instance_id: String,
    /// Proxies to generate, in processing order.
    pub proxies: Vec<String>,
    /// Delay between leader lock attempts.
    pub lock_retry: Duration,
    /// How long in-flight generation may take to stop.
    pub shutdown_timeout: Duration,
    /// Quiet period after a change before regenerating.
    pub debounce: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            instance_id: "neon-proxy-manager".to_string(),
            proxies: vec!["public".to_string(), "private".to_string()],
            lock_retry: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            debounce: Duration::from_millis(250),
        }
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n * 24 * 60 * 60)
}

fn positive(key: &str, value: u64, default: u64) -> u64 {
    if value == 0 {
        warn!(key, default, "zero is not allowed here, using the default");
        default
    } else {
        value
    }
}

/// Read a JSON value at `key`, writing `default` when absent and `init`
/// is set.
///
/// A value that does not parse is left alone for the operator to fix and
/// the default is used in its place.
async fn load_or_init<T>(store: &dyn ConfigStore, key: &str, default: T, init: bool) -> StoreResult<T>
where
    T: Serialize + DeserializeOwned + std::fmt::Debug,
{
    match store.get(key).await? {
        Some(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(key, error = %e, ?default, "unparseable manager setting, using the default");
                Ok(default)
            }
        },
        None if !init => Ok(default),
        None => {
            let bytes = serde_json::to_vec(&default)
                .map_err(|e| neon_store::StoreError::Serialize(e.to_string()))?;
            store.put(key, &bytes).await?;
            info!(key, ?default, "initialized manager setting");
            Ok(default)
        }
    }
}
