//! TLS certificates loaded from the secret store.
//!
//! Each certificate is a JSON secret document under `neon-secret/cert/`
//! holding PEM material. The host names a certificate covers and its
//! validity window are read from the leaf certificate itself; the optional
//! `hosts`, `valid_from` and `valid_until` fields of the document are only
//! cross-checked against it. The registry is loaded fresh every generation
//! cycle. Which certificates a cycle actually used is tracked separately in
//! [`ReferencedCertificates`], so a shared registry is never mutated by
//! synthesis.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use neon_store::SecretStore;

use crate::error::{ProxyError, ProxyResult};

/// The secret document layout of a certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateDocument {
    /// PEM certificate chain, leaf first.
    pub cert: String,
    /// PEM private key.
    pub key: String,
    /// Host names the operator expects the leaf to carry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<u64>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
}

/// A parsed certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    pub name: String,
    /// Where the certificate lives in the secret store.
    pub secret_path: String,
    pub document: CertificateDocument,
    /// Lowercase DNS subject alternative names of the leaf, or its common
    /// name when it carries none.
    pub hosts: Vec<String>,
    /// Leaf `notBefore`, unix seconds.
    pub valid_from: u64,
    /// Leaf `notAfter`, unix seconds.
    pub valid_until: u64,
    /// SHA-256 of the canonical serialized document.
    pub hash: [u8; 32],
}

impl CertInfo {
    /// Parse a secret document, checking that it carries a decodable X.509
    /// certificate and a private key.
    pub fn from_document(
        name: &str,
        secret_path: &str,
        document: CertificateDocument,
    ) -> ProxyResult<Self> {
        let invalid = |reason: String| ProxyError::Certificate {
            name: name.to_string(),
            reason,
        };

        let mut cert_reader = document.cert.as_bytes();
        let chain = rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("unreadable certificate PEM: {e}")))?;
        let Some(leaf) = chain.first() else {
            return Err(invalid("no certificate in PEM".to_string()));
        };

        let mut key_reader = document.key.as_bytes();
        match rustls_pemfile::private_key(&mut key_reader) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(invalid("no private key in PEM".to_string())),
            Err(e) => return Err(invalid(format!("unreadable key PEM: {e}"))),
        }

        let (_, x509) = parse_x509_certificate(leaf.as_ref())
            .map_err(|e| invalid(format!("unreadable certificate: {e}")))?;

        let mut hosts = BTreeSet::new();
        let san = x509
            .subject_alternative_name()
            .map_err(|e| invalid(format!("bad subject alternative names: {e}")))?;
        if let Some(san) = san {
            for general_name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = general_name {
                    hosts.insert(dns.to_ascii_lowercase());
                }
            }
        }
        if hosts.is_empty() {
            for cn in x509.subject().iter_common_name() {
                if let Ok(cn) = cn.as_str() {
                    hosts.insert(cn.to_ascii_lowercase());
                }
            }
        }

        let validity = x509.validity();
        let valid_from = unix_seconds(validity.not_before.timestamp());
        let valid_until = unix_seconds(validity.not_after.timestamp());

        let declared: BTreeSet<String> =
            document.hosts.iter().map(|h| h.to_ascii_lowercase()).collect();
        if !declared.is_empty() && declared != hosts {
            warn!(cert = %name, ?declared, actual = ?hosts, "declared hosts differ from the certificate");
        }
        if document.valid_from.is_some_and(|t| t != valid_from)
            || document.valid_until.is_some_and(|t| t != valid_until)
        {
            warn!(cert = %name, valid_from, valid_until, "declared validity differs from the certificate");
        }

        let canonical = serde_json::to_vec(&document).map_err(|e| invalid(e.to_string()))?;
        let hash: [u8; 32] = Sha256::digest(&canonical).into();

        Ok(Self {
            name: name.to_string(),
            secret_path: secret_path.to_string(),
            document,
            hosts: hosts.into_iter().collect(),
            valid_from,
            valid_until,
            hash,
        })
    }

    /// Whether this certificate's names cover `host`.
    ///
    /// Matching is case-insensitive. `*.example.com` covers exactly one
    /// extra label: `api.example.com` but not `a.b.example.com`.
    pub fn covers(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|pattern| {
            if *pattern == host {
                return true;
            }
            if let Some(suffix) = pattern.strip_prefix("*.")
                && let Some(label) = host.strip_suffix(suffix)
                && let Some(label) = label.strip_suffix('.')
            {
                return !label.is_empty() && !label.contains('.');
            }
            false
        })
    }

    /// Whether `now` lies inside the validity window.
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.valid_from <= now && now <= self.valid_until
    }
}

/// Pre-epoch times clamp to zero.
fn unix_seconds(timestamp: i64) -> u64 {
    u64::try_from(timestamp).unwrap_or(0)
}

/// Names of the certificates referenced by one synthesis pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferencedCertificates {
    names: BTreeSet<String>,
}

impl ReferencedCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every reference; called at the start of a pass.
    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn mark(&mut self, name: &str) {
        self.names.insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Referenced names in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Every certificate available to this cycle, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CertificateRegistry {
    certs: BTreeMap<String, CertInfo>,
}

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from already parsed certificates.
    pub fn from_certs(certs: impl IntoIterator<Item = CertInfo>) -> Self {
        Self {
            certs: certs.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    /// Load every certificate under `prefix` from the secret store.
    ///
    /// Expired and soon-to-expire certificates are logged but still loaded.
    /// Unparseable documents are logged and skipped. A secret store failure
    /// is returned so the caller can abandon the cycle.
    pub async fn load_all(
        secrets: &dyn SecretStore,
        prefix: &str,
        warn_window: Duration,
        now: u64,
    ) -> ProxyResult<Self> {
        let names = secrets.list(prefix).await?;
        let mut certs = BTreeMap::new();

        for name in names {
            let path = format!("{prefix}{name}");
            let Some(value) = secrets.read(&path).await? else {
                // Deleted between list and read.
                debug!(%path, "certificate disappeared while loading");
                continue;
            };

            let parsed = serde_json::from_value::<CertificateDocument>(value)
                .map_err(|e| ProxyError::Certificate {
                    name: name.clone(),
                    reason: e.to_string(),
                })
                .and_then(|doc| CertInfo::from_document(&name, &path, doc));

            match parsed {
                Ok(cert) => {
                    check_expiry(&cert, warn_window, now);
                    certs.insert(name, cert);
                }
                Err(e) => error!(%path, error = %e, "skipping unreadable certificate"),
            }
        }

        info!(count = certs.len(), "certificates loaded");
        Ok(Self { certs })
    }

    pub fn get(&self, name: &str) -> Option<&CertInfo> {
        self.certs.get(name)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Certificates in name order.
    pub fn iter(&self) -> impl Iterator<Item = &CertInfo> {
        self.certs.values()
    }

    /// Start a new reference-tracking pass.
    pub fn clear_references(&self) -> ReferencedCertificates {
        ReferencedCertificates::new()
    }

    /// Combined hash of the referenced certificates.
    ///
    /// Each referenced certificate's hash is concatenated in name order and
    /// the result hashed again. Used for change detection only.
    pub fn hash_referenced(&self, referenced: &ReferencedCertificates) -> ProxyResult<[u8; 32]> {
        let mut hasher = Sha256::new();
        for name in referenced.iter() {
            let cert = self
                .certs
                .get(name)
                .ok_or_else(|| ProxyError::MissingCertificate(name.to_string()))?;
            hasher.update(cert.hash);
        }
        Ok(hasher.finalize().into())
    }
}

fn check_expiry(cert: &CertInfo, warn_window: Duration, now: u64) {
    let valid_until = cert.valid_until;
    if now > valid_until {
        error!(cert = %cert.name, valid_until, "certificate has expired");
    } else if valid_until - now <= warn_window.as_secs() {
        let days_left = (valid_until - now) / 86_400;
        warn!(cert = %cert.name, days_left, "certificate expires soon");
    }
    if now < cert.valid_from {
        warn!(cert = %cert.name, valid_from = cert.valid_from, "certificate is not valid yet");
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use neon_store::{ClusterStore, StoreError, StoreResult};
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, date_time_ymd};

    const DAY: u64 = 86_400;
    /// 2023-11-14.
    const NOW: u64 = 1_700_000_000;

    /// Self-signed leaf for `hosts`, valid over the given calendar years.
    pub(crate) fn pem_pair(hosts: &[&str], from_year: i32, until_year: i32) -> (String, String) {
        let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        let mut params = CertificateParams::new(names).unwrap();
        params.not_before = date_time_ymd(from_year, 1, 1);
        params.not_after = date_time_ymd(until_year, 1, 1);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    pub(crate) fn document(hosts: &[&str]) -> CertificateDocument {
        let (cert, key) = pem_pair(hosts, 2023, 2025);
        CertificateDocument {
            cert,
            key,
            hosts: Vec::new(),
            valid_from: None,
            valid_until: None,
        }
    }

    pub(crate) fn cert(name: &str, hosts: &[&str]) -> CertInfo {
        CertInfo::from_document(name, &format!("neon-secret/cert/{name}"), document(hosts)).unwrap()
    }

    struct UnavailableSecrets;

    #[async_trait]
    impl SecretStore for UnavailableSecrets {
        async fn list(&self, _prefix: &str) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("vault sealed".to_string()))
        }

        async fn read(&self, _path: &str) -> StoreResult<Option<serde_json::Value>> {
            Err(StoreError::Unavailable("vault sealed".to_string()))
        }
    }

    #[test]
    fn exact_host_match_is_case_insensitive() {
        let cert = cert("site", &["Site.Example.com"]);
        assert!(cert.covers("site.example.com"));
        assert!(cert.covers("SITE.example.com"));
        assert!(!cert.covers("other.example.com"));
    }

    #[test]
    fn wildcard_covers_one_label() {
        let cert = cert("wild", &["*.example.com"]);
        assert!(cert.covers("api.example.com"));
        assert!(!cert.covers("a.b.example.com"));
        assert!(!cert.covers("example.com"));
        assert!(!cert.covers("apiexample.com"));
    }

    #[test]
    fn coverage_comes_from_the_certificate_not_the_document() {
        let mut doc = document(&["site.example.com"]);
        doc.hosts = vec!["evil.example.com".to_string()];
        doc.valid_until = Some(4_000_000_000);
        let cert = CertInfo::from_document("site", "p", doc).unwrap();

        assert_eq!(cert.hosts, vec!["site.example.com"]);
        assert!(cert.covers("site.example.com"));
        assert!(!cert.covers("evil.example.com"));
        assert!(!cert.is_valid_at(3_900_000_000));
    }

    #[test]
    fn common_name_is_used_without_alternative_names() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "legacy.example.com");
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let pem = params.self_signed(&key).unwrap().pem();
        let doc = CertificateDocument {
            cert: pem,
            key: key.serialize_pem(),
            hosts: Vec::new(),
            valid_from: None,
            valid_until: None,
        };

        let cert = CertInfo::from_document("legacy", "p", doc).unwrap();
        assert!(cert.covers("legacy.example.com"));
    }

    #[test]
    fn undecodable_certificate_is_rejected() {
        let mut doc = document(&["a.example.com"]);
        doc.cert = "-----BEGIN CERTIFICATE-----\nAQIDBAUGBwg=\n-----END CERTIFICATE-----\n".to_string();
        let err = CertInfo::from_document("junk", "p", doc).unwrap_err();
        assert!(err.to_string().contains("unreadable certificate"), "{err}");
    }

    #[test]
    fn document_without_key_is_rejected() {
        let mut doc = document(&["a.example.com"]);
        doc.key = "not a key".to_string();
        let err = CertInfo::from_document("bad", "neon-secret/cert/bad", doc).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn document_without_certificate_is_rejected() {
        let mut doc = document(&["a.example.com"]);
        doc.cert = String::new();
        assert!(CertInfo::from_document("bad", "p", doc).is_err());
    }

    #[test]
    fn hash_tracks_content() {
        let doc = document(&["a.example.com"]);
        let a = CertInfo::from_document("a", "p", doc.clone()).unwrap();
        let same = CertInfo::from_document("a", "p", doc).unwrap();
        let other = cert("a", &["a.example.com"]);
        assert_eq!(a.hash, same.hash);
        assert_ne!(a.hash, other.hash);
    }

    #[test]
    fn validity_window() {
        let cert = cert("a", &["a.example.com"]);
        assert!(cert.is_valid_at(NOW));
        assert!(!cert.is_valid_at(NOW + 400 * DAY));
        assert!(!cert.is_valid_at(1_600_000_000));
    }

    #[test]
    fn referenced_hash_ignores_unreferenced_certificates() {
        let a = cert("a", &["a.example.com"]);
        let b = cert("b", &["b.example.com"]);
        let registry = CertificateRegistry::from_certs([a.clone(), b.clone()]);
        let mut refs = registry.clear_references();
        refs.mark("a");
        let before = registry.hash_referenced(&refs).unwrap();

        let changed_b = CertificateRegistry::from_certs([a, cert("b", &["b.example.com"])]);
        assert_eq!(changed_b.hash_referenced(&refs).unwrap(), before);

        let changed_a = CertificateRegistry::from_certs([cert("a", &["a.example.com"]), b]);
        assert_ne!(changed_a.hash_referenced(&refs).unwrap(), before);
    }

    #[test]
    fn referenced_hash_requires_loaded_certificates() {
        let registry = CertificateRegistry::new();
        let mut refs = ReferencedCertificates::new();
        refs.mark("ghost");
        assert!(matches!(
            registry.hash_referenced(&refs),
            Err(ProxyError::MissingCertificate(name)) if name == "ghost"
        ));
    }

    #[test]
    fn clearing_references_starts_empty() {
        let mut refs = ReferencedCertificates::new();
        refs.mark("b");
        refs.mark("a");
        assert_eq!(refs.iter().collect::<Vec<_>>(), vec!["a", "b"]);
        refs.clear();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn load_all_keeps_expired_and_skips_unreadable() {
        let store = ClusterStore::open_in_memory().unwrap();
        let good = serde_json::to_value(document(&["good.example.com"])).unwrap();
        let (cert, key) = pem_pair(&["old.example.com"], 2021, 2023);
        let expired = serde_json::json!({ "cert": cert, "key": key });

        store.put_secret("neon-secret/cert/good", &good).unwrap();
        store.put_secret("neon-secret/cert/old", &expired).unwrap();
        store
            .put_secret("neon-secret/cert/broken", &serde_json::json!({ "cert": 1 }))
            .unwrap();

        let registry = CertificateRegistry::load_all(
            &store,
            "neon-secret/cert/",
            Duration::from_secs(30 * DAY),
            NOW,
        )
        .await
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("good").is_some());
        assert!(!registry.get("old").unwrap().is_valid_at(NOW));
        assert!(registry.get("broken").is_none());
        assert_eq!(registry.get("good").unwrap().secret_path, "neon-secret/cert/good");
    }

    #[tokio::test]
    async fn load_all_propagates_secret_store_failures() {
        let result = CertificateRegistry::load_all(
            &UnavailableSecrets,
            "neon-secret/cert/",
            Duration::from_secs(30 * DAY),
            NOW,
        )
        .await;
        assert!(matches!(result, Err(ProxyError::Store(_))));
    }
}
