//! Change detection against the last published artifact.

use neon_proxy::{CertificateRegistry, ProxyResult, ReferencedCertificates, keys};
use neon_store::{ConfigStore, StoreResult};
use sha2::{Digest, Sha256};

/// Compares freshly rendered bundles with what is already published.
pub struct ChangeDetector<'a> {
    store: &'a dyn ConfigStore,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(store: &'a dyn ConfigStore) -> Self {
        Self { store }
    }

    /// Content hash of a bundle plus the certificates it references.
    ///
    /// Certificate material is not in the bundle, so it is folded in
    /// separately: a renewed certificate must change the hash even when the
    /// config text does not.
    pub fn compute_hash(
        bundle: &[u8],
        certs: &CertificateRegistry,
        referenced: &ReferencedCertificates,
    ) -> ProxyResult<String> {
        let bundle_hash = Sha256::digest(bundle);
        if referenced.is_empty() {
            return Ok(hex::encode(bundle_hash));
        }

        let mut hasher = Sha256::new();
        hasher.update(bundle_hash);
        hasher.update(certs.hash_referenced(referenced)?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Hash currently published for `proxy`, if any.
    pub async fn published_hash(&self, proxy: &str) -> StoreResult<Option<String>> {
        let bytes = self.store.get(&keys::published_hash_key(proxy)).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Whether `hash` differs from the published one. Nothing published
    /// counts as a change.
    pub async fn has_changed(&self, proxy: &str, hash: &str) -> StoreResult<bool> {
        Ok(self.published_hash(proxy).await?.as_deref() != Some(hash))
    }
}
