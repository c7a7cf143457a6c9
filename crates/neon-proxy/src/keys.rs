//! Well-known key layout in the config and secret stores.

/// Root of everything the proxy manager owns.
pub const MANAGER_ROOT: &str = "neon/service/neon-proxy-manager";

/// Operator-maintained configuration; the manager watches this prefix.
pub const CONF_PREFIX: &str = "neon/service/neon-proxy-manager/conf/";

/// Leader election lock.
pub const LEADER_LOCK_KEY: &str = "neon/service/neon-proxy-manager/leader";

/// Secret-store prefix holding TLS certificates.
pub const CERT_SECRET_PREFIX: &str = "neon-secret/cert/";

/// Manager setting: leader lock session TTL in seconds.
pub const LOCK_TTL_KEY: &str = "neon/service/neon-proxy-manager/conf/lock-ttl-seconds";

/// Manager setting: watch timeout / fallback poll interval in seconds.
pub const POLL_SECONDS_KEY: &str = "neon/service/neon-proxy-manager/conf/poll-seconds";

/// Manager setting: certificate expiry warning window in days.
pub const CERT_WARN_DAYS_KEY: &str = "neon/service/neon-proxy-manager/conf/cert-warn-days";

/// Manager setting: treat certificate host mismatches as errors.
pub const STRICT_CERT_HOSTS_KEY: &str = "neon/service/neon-proxy-manager/conf/strict-cert-hosts";

/// Settings document for a proxy.
pub fn settings_key(proxy: &str) -> String {
    format!("{CONF_PREFIX}proxies/{proxy}/settings")
}

/// Prefix under which a proxy's routes are stored.
pub fn routes_prefix(proxy: &str) -> String {
    format!("{CONF_PREFIX}proxies/{proxy}/routes/")
}

/// Key of a single route.
pub fn route_key(proxy: &str, route: &str) -> String {
    format!("{}{route}", routes_prefix(proxy))
}

/// Published configuration hash for a proxy.
pub fn published_hash_key(proxy: &str) -> String {
    format!("{MANAGER_ROOT}/proxies/{proxy}/proxy-hash")
}

/// Published configuration bundle for a proxy.
pub fn published_bundle_key(proxy: &str) -> String {
    format!("{MANAGER_ROOT}/proxies/{proxy}/proxy-conf")
}

/// Secret path of a named certificate.
pub fn cert_secret_path(name: &str) -> String {
    format!("{CERT_SECRET_PREFIX}{name}")
}
