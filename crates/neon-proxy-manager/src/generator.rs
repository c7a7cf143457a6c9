//! One generation cycle per proxy.
//!
//! Certificates are loaded, then the definition is loaded and validated,
//! rendered, packaged, hashed and finally published. Each proxy gets its
//! own certificate load and reference set, so a failure in one proxy never
//! leaks into another.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use neon_proxy::{
    CertificateRegistry, RenderedConfig, RouteTable, ValidationOptions, build_bundle, keys, render,
};
use neon_store::{ConfigStore, LeaseGuard, SecretStore};
use tracing::{debug, error, info, warn};

use crate::change::ChangeDetector;
use crate::config::ManagerConfig;
use crate::error::{CycleError, CycleResult};
use crate::publisher::{PublishOutcome, Publisher};

/// A rendered, packaged and hashed bundle that has not been published.
#[derive(Debug, Clone)]
pub struct PreparedBundle {
    pub proxy: String,
    pub rendered: RenderedConfig,
    pub bundle: Vec<u8>,
    pub hash: String,
    pub warnings: Vec<String>,
}

/// Tally of one pass over every proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub published: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct ConfigGenerator {
    config: Arc<dyn ConfigStore>,
    secrets: Arc<dyn SecretStore>,
    /// Reloaded from the store at the start of every pass.
    settings: RwLock<ManagerConfig>,
    /// Write missing defaults back to the store.
    bootstrap: bool,
}

impl ConfigGenerator {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        secrets: Arc<dyn SecretStore>,
        settings: ManagerConfig,
    ) -> Self {
        Self {
            config,
            secrets,
            settings: RwLock::new(settings),
            bootstrap: true,
        }
    }

    /// Never write to the config store: missing settings are defaulted in
    /// memory and nothing is published.
    pub fn dry_run(mut self) -> Self {
        self.bootstrap = false;
        self
    }

    /// The settings the next cycle will use.
    pub fn settings(&self) -> ManagerConfig {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the manager settings so edits apply without a new election.
    ///
    /// The lock TTL is fixed for the lifetime of a session; a new value is
    /// picked up at the next election. On a store failure the previous
    /// settings stay in effect.
    pub async fn refresh_settings(&self) -> ManagerConfig {
        let loaded = if self.bootstrap {
            ManagerConfig::load(self.config.as_ref()).await
        } else {
            ManagerConfig::read(self.config.as_ref()).await
        };
        match loaded {
            Ok(fresh) => {
                let mut current = self.settings.write().unwrap_or_else(PoisonError::into_inner);
                if *current != fresh {
                    info!(
                        poll_secs = fresh.poll_interval.as_secs(),
                        cert_warn_days = fresh.cert_warn_window.as_secs() / 86_400,
                        strict_cert_hosts = fresh.strict_cert_hosts,
                        "manager settings changed"
                    );
                    *current = fresh.clone();
                }
                fresh
            }
            Err(e) => {
                warn!(error = %e, "failed to reload manager settings, keeping the previous ones");
                self.settings()
            }
        }
    }

    /// Everything up to, but not including, publishing.
    pub async fn prepare(&self, proxy: &str) -> CycleResult<PreparedBundle> {
        let settings = self.settings();
        let certs = CertificateRegistry::load_all(
            self.secrets.as_ref(),
            keys::CERT_SECRET_PREFIX,
            settings.cert_warn_window,
            unix_now(),
        )
        .await?;

        let table = if self.bootstrap {
            RouteTable::new(self.config.as_ref())
        } else {
            RouteTable::read_only(self.config.as_ref())
        };
        let definition = table.load(proxy).await?;
        let validation = definition.validate(
            &certs,
            ValidationOptions {
                strict_cert_hosts: settings.strict_cert_hosts,
            },
        );
        for warning in &validation.warnings {
            warn!(proxy = %proxy, %warning, "proxy validation warning");
        }
        for problem in &validation.errors {
            error!(proxy = %proxy, error = %problem, "proxy validation error");
        }
        let warnings = validation.warnings.clone();
        validation.into_result(proxy)?;

        // Validation passed, so anything render rejects is a bug.
        let rendered = render(&definition, &certs).map_err(|e| {
            CycleError::Fatal(format!("proxy [{proxy}] failed to render after validation: {e}"))
        })?;
        let bundle = build_bundle(&rendered)?;
        let hash = ChangeDetector::compute_hash(&bundle, &certs, &rendered.referenced)
            .map_err(|e| CycleError::Fatal(format!("proxy [{proxy}] hash failed: {e}")))?;

        debug!(
            proxy = %proxy,
            hash = %hash,
            bytes = bundle.len(),
            certificates = rendered.referenced.len(),
            "prepared proxy bundle"
        );

        Ok(PreparedBundle {
            proxy: proxy.to_string(),
            rendered,
            bundle,
            hash,
            warnings,
        })
    }

    /// Generate and publish one proxy while `leadership` is held.
    pub async fn generate(&self, proxy: &str, leadership: &LeaseGuard) -> CycleResult<PublishOutcome> {
        if !leadership.is_held() {
            return Err(CycleError::LeadershipLost);
        }
        if !self.bootstrap {
            return Err(CycleError::Fatal("a dry-run generator cannot publish".to_string()));
        }
        let prepared = self.prepare(proxy).await?;

        // A demoted instance must never publish.
        if !leadership.is_held() {
            return Err(CycleError::LeadershipLost);
        }
        Publisher::new(self.config.as_ref())
            .publish(proxy, &prepared.hash, &prepared.bundle)
            .await
    }

    /// Refresh the settings, then generate every proxy in order.
    ///
    /// Store and validation failures are logged and counted; they only
    /// affect their own proxy. Leadership loss and fatal errors stop the
    /// pass and are returned.
    pub async fn generate_all(
        &self,
        proxies: &[String],
        leadership: &LeaseGuard,
    ) -> CycleResult<CycleSummary> {
        self.refresh_settings().await;
        let mut summary = CycleSummary::default();
        for proxy in proxies {
            match self.generate(proxy, leadership).await {
                Ok(PublishOutcome::Published) => summary.published += 1,
                Ok(PublishOutcome::Unchanged) => summary.unchanged += 1,
                Err(CycleError::Store(e)) => {
                    warn!(proxy = %proxy, error = %e, "store error, generation skipped until next cycle");
                    summary.failed += 1;
                }
                Err(CycleError::Validation(e)) => {
                    error!(proxy = %proxy, error = %e, "proxy not generated");
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            published = summary.published,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "generation cycle complete"
        );
        Ok(summary)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
