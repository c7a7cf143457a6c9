//! Loading a proxy's settings and routes from the config store.

use neon_store::ConfigStore;
use tracing::{debug, info, warn};

use crate::definition::ProxyDefinition;
use crate::error::{ProxyError, ProxyResult};
use crate::keys;
use crate::route::ProxyRoute;
use crate::settings::ProxySettings;

/// Reads proxy definitions out of a [`ConfigStore`].
pub struct RouteTable<'a> {
    store: &'a dyn ConfigStore,
    /// Persist default settings for a proxy that has none.
    bootstrap: bool,
}

impl<'a> RouteTable<'a> {
    pub fn new(store: &'a dyn ConfigStore) -> Self {
        Self {
            store,
            bootstrap: true,
        }
    }

    /// A table that never writes: missing settings are defaulted in memory.
    pub fn read_only(store: &'a dyn ConfigStore) -> Self {
        Self {
            store,
            bootstrap: false,
        }
    }

    /// Read settings for `proxy`, writing defaults back on first run
    /// unless the table is read-only.
    pub async fn load_settings(&self, proxy: &str) -> ProxyResult<ProxySettings> {
        let key = keys::settings_key(proxy);
        match self.store.get(&key).await? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| ProxyError::Settings {
                    proxy: proxy.to_string(),
                    reason: e.to_string(),
                })
            }
            None if !self.bootstrap => {
                debug!(proxy = %proxy, "no stored settings, using defaults");
                Ok(ProxySettings::defaults_for(proxy))
            }
            None => {
                let settings = ProxySettings::defaults_for(proxy);
                let bytes = serde_json::to_vec_pretty(&settings).map_err(|e| {
                    ProxyError::Settings {
                        proxy: proxy.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                self.store.put(&key, &bytes).await?;
                info!(
                    proxy = %proxy,
                    first_port = settings.first_port,
                    last_port = settings.last_port,
                    "initialized default proxy settings"
                );
                Ok(settings)
            }
        }
    }

    /// Assemble the full definition for `proxy`.
    ///
    /// Routes are keyed by the last segment of their store key. A route
    /// whose document names something else is kept under its key so that
    /// validation reports the mismatch.
    pub async fn load(&self, proxy: &str) -> ProxyResult<ProxyDefinition> {
        let settings = self.load_settings(proxy).await?;
        let mut definition = ProxyDefinition::new(proxy, settings);

        let prefix = keys::routes_prefix(proxy);
        for (key, bytes) in self.store.list(&prefix).await? {
            let Some(name) = key.strip_prefix(&prefix) else {
                continue;
            };
            if name.is_empty() || name.contains('/') {
                warn!(proxy = %proxy, key = %key, "ignoring entry outside the route namespace");
                continue;
            }
            let route: ProxyRoute =
                serde_json::from_slice(&bytes).map_err(|e| ProxyError::Route {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            definition.routes.insert(name.to_string(), route);
        }

        debug!(proxy = %proxy, routes = definition.routes.len(), "loaded proxy definition");
        Ok(definition)
    }
}
