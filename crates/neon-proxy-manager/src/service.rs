//! The top-level manager loop: win leadership, generate while leading,
//! and start over when leadership is lost.

use std::sync::Arc;

use neon_store::{ConfigStore, LockHandle, SecretStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ManagerConfig, RunOptions};
use crate::error::{CycleError, CycleResult};
use crate::generator::ConfigGenerator;
use crate::leader::LeaderCoordinator;
use crate::monitor::Monitor;

/// Why a leadership term ended.
enum TermEnd {
    Shutdown,
    LeadershipLost,
    MonitorExited(CycleResult<()>),
}

pub struct ProxyManager {
    config: Arc<dyn ConfigStore>,
    secrets: Arc<dyn SecretStore>,
    options: RunOptions,
}

impl ProxyManager {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        secrets: Arc<dyn SecretStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            config,
            secrets,
            options,
        }
    }

    /// Run until `shutdown` fires or a fatal error occurs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> CycleResult<()> {
        info!(
            instance = %self.options.instance_id,
            proxies = ?self.options.proxies,
            "proxy manager starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let settings = match ManagerConfig::load(self.config.as_ref()).await {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(error = %e, "failed to load manager settings, will retry");
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let coordinator = LeaderCoordinator::new(
                Arc::clone(&self.config),
                self.options.instance_id.clone(),
                settings.lock_ttl,
                self.options.lock_retry,
            );
            let Some(lock) = coordinator.acquire(&mut shutdown).await else {
                break;
            };

            match self.lead(lock, settings, &mut shutdown).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => return Err(e),
            }
        }

        info!(instance = %self.options.instance_id, "proxy manager stopped");
        Ok(())
    }

    /// One leadership term. Returns whether to compete for the lock again.
    async fn lead(
        &self,
        lock: LockHandle,
        settings: ManagerConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CycleResult<bool> {
        let generator = Arc::new(ConfigGenerator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.secrets),
            settings,
        ));
        let monitor = Monitor::new(
            generator,
            Arc::clone(&self.config),
            self.options.proxies.clone(),
            lock.guard(),
            self.options.debounce,
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut task = tokio::spawn(monitor.run(cancel_rx));

        let end = tokio::select! {
            _ = shutdown.changed() => TermEnd::Shutdown,
            _ = lock.lost() => TermEnd::LeadershipLost,
            joined = &mut task => TermEnd::MonitorExited(joined.unwrap_or_else(|e| {
                Err(CycleError::Fatal(format!("monitor task failed: {e}")))
            })),
        };

        if !matches!(end, TermEnd::MonitorExited(_)) {
            let _ = cancel_tx.send(true);
            self.stop_monitor(task).await;
        }

        match end {
            TermEnd::Shutdown => {
                info!("shutdown requested, releasing leadership");
                release(lock).await;
                Ok(false)
            }
            TermEnd::LeadershipLost | TermEnd::MonitorExited(Err(CycleError::LeadershipLost)) => {
                warn!("leadership lost, generation stopped");
                drop(lock);
                Ok(true)
            }
            TermEnd::MonitorExited(Ok(())) => {
                debug!("monitor exited, re-entering election");
                release(lock).await;
                Ok(true)
            }
            TermEnd::MonitorExited(Err(e)) if e.is_fatal() => {
                error!(error = %e, "fatal generation error");
                release(lock).await;
                Err(e)
            }
            TermEnd::MonitorExited(Err(e)) => {
                warn!(error = %e, "monitor stopped, stepping down before retrying");
                release(lock).await;
                Ok(self.pause(shutdown).await)
            }
        }
    }

    /// Wait for a cancelled monitor, aborting it after the shutdown timeout.
    async fn stop_monitor(&self, mut task: JoinHandle<CycleResult<()>>) {
        match tokio::time::timeout(self.options.shutdown_timeout, &mut task).await {
            Ok(_) => debug!("monitor stopped"),
            Err(_) => {
                warn!(
                    timeout_secs = self.options.shutdown_timeout.as_secs(),
                    "monitor did not stop in time, aborting"
                );
                task.abort();
            }
        }
    }

    /// Sleep for the retry delay. Returns false if shutdown fired instead.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.options.lock_retry) => true,
            _ = shutdown.changed() => false,
        }
    }
}

async fn release(lock: LockHandle) {
    if let Err(e) = lock.release().await {
        warn!(error = %e, "failed to release leadership, it will expire");
    }
}
