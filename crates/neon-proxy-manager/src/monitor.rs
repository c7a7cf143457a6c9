//! The leader's watch/poll loop.
//!
//! Generates every proxy once on start, then again whenever something
//! under the manager's `conf/` prefix changes or the poll interval passes
//! without a change. Runs until cancelled or until leadership is lost.

use std::sync::Arc;
use std::time::Duration;

use neon_proxy::keys;
use neon_store::{ConfigStore, LeaseGuard, StoreError, WatchEvent};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{CycleError, CycleResult};
use crate::generator::ConfigGenerator;

pub struct Monitor {
    generator: Arc<ConfigGenerator>,
    store: Arc<dyn ConfigStore>,
    proxies: Vec<String>,
    leadership: LeaseGuard,
    debounce: Duration,
}

impl Monitor {
    pub fn new(
        generator: Arc<ConfigGenerator>,
        store: Arc<dyn ConfigStore>,
        proxies: Vec<String>,
        leadership: LeaseGuard,
        debounce: Duration,
    ) -> Self {
        Self {
            generator,
            store,
            proxies,
            leadership,
            debounce,
        }
    }

    /// Run until `cancel` fires (returns `Ok`), leadership is lost, or a
    /// cycle fails fatally.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> CycleResult<()> {
        // Subscribe before the first cycle so no change slips between them.
        let mut watcher = self.store.watch(keys::CONF_PREFIX);
        let mut cycles: u64 = 0;

        info!(proxies = ?self.proxies, "proxy monitor started");

        loop {
            if *cancel.borrow() {
                return Ok(());
            }

            cycles += 1;
            debug!(cycle = cycles, "starting generation cycle");
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    debug!("monitor cancelled during generation");
                    return Ok(());
                }
                _ = self.leadership.lost() => return Err(CycleError::LeadershipLost),
                result = self.generator.generate_all(&self.proxies, &self.leadership) => {
                    result?;
                }
            }

            // Settings may have been edited by the pass that just ran.
            let poll = self.generator.settings().poll_interval;
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    debug!("monitor shutting down");
                    return Ok(());
                }
                _ = self.leadership.lost() => return Err(CycleError::LeadershipLost),
                event = watcher.changed(poll) => match event {
                    WatchEvent::Changed => {
                        debug!(debounce_ms = self.debounce.as_millis() as u64, "configuration changed");
                        tokio::select! {
                            _ = tokio::time::sleep(self.debounce) => {}
                            _ = cancel.changed() => return Ok(()),
                        }
                        let coalesced = watcher.drain_pending();
                        if coalesced > 0 {
                            debug!(coalesced, "coalesced further changes");
                        }
                    }
                    WatchEvent::TimedOut => debug!("poll interval elapsed, resynchronizing"),
                    WatchEvent::Closed => {
                        return Err(CycleError::Store(StoreError::Unavailable(
                            "config watch closed".to_string(),
                        )));
                    }
                },
            }
        }
    }
}
