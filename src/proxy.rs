//! Registry of backend connections, keyed by route name.

use crate::backend::BackendConnection;
use crate::config::ServerConfig;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Manages all backend connections.
///
/// `ProxyManager` is designed to be used behind an `Arc` for shared ownership
/// across async tasks; the [`new`](ProxyManager::new) constructor returns
/// `Arc<Self>` directly to enforce this pattern.
pub struct ProxyManager {
    backends: DashMap<String, Arc<BackendConnection>>,
}

impl ProxyManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
        })
    }

    /// Start one backend connection per configured entry, sequentially.
    ///
    /// A failed start is logged and that backend is simply absent from the
    /// registry thereafter; it never aborts startup of the remaining entries.
    pub async fn start_all(
        &self,
        servers: &HashMap<String, ServerConfig>,
        handshake_timeout: Duration,
    ) {
        info!(count = servers.len(), "Starting backend servers");

        let mut names: Vec<&String> = servers.keys().collect();
        names.sort();

        for name in names {
            let config = &servers[name];
            match BackendConnection::start(name, config, handshake_timeout).await {
                Ok(connection) => {
                    self.backends.insert(name.clone(), Arc::new(connection));
                }
                Err(e) => {
                    error!(server = %name, error = %e, "Failed to start backend");
                }
            }
        }

        info!(started = self.backends.len(), "Backend startup finished");
    }

    /// Look up a backend connection by name
    pub fn get_backend(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.backends.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of all registered backends, sorted for stable listings
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Stop every registered connection, best-effort, then clear the registry.
    ///
    /// Stop problems are swallowed so every connection still receives its
    /// stop attempt.
    pub async fn stop_all(&self, grace_period: Duration) {
        let names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some(connection) = self.get_backend(&name) {
                connection.stop(grace_period).await;
            } else {
                warn!(server = %name, "Backend vanished before stop");
            }
        }
        self.backends.clear();
    }
}
