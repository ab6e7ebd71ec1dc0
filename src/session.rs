//! Session registry and idle reaper.
//!
//! A session is one caller's conversation with one backend. The registry is
//! the sole source of truth for liveness: a session exists exactly while its
//! entry is present, removal is terminal, and ids are never reused.

use crate::backend::BackendConnection;
use crate::endpoint::ForwardingEndpoint;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

/// One live conversation between an external caller and a backend
pub struct Session {
    id: String,
    server_name: String,
    endpoint: ForwardingEndpoint,
    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn endpoint(&self) -> &ForwardingEndpoint {
        &self.endpoint
    }

    /// Refresh last-activity to now
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Result of one idle sweep
#[derive(Debug, Clone, Copy)]
pub struct SweepReport {
    pub purged: usize,
    pub remaining: usize,
}

/// Session counts for the health endpoint
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionCounts {
    pub total: usize,
    pub active: usize,
    pub stale: usize,
}

/// Registry of live sessions, keyed by opaque id
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
        })
    }

    /// Look up a session and refresh its last-activity.
    ///
    /// The refresh happens here, synchronously, so it precedes any await
    /// point in the caller's forward; a sweep interleaving after this lookup
    /// observes fresh activity and cannot evict the session mid-flight.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))?;
        session.touch();
        Some(session)
    }

    /// Create a session against the given backend: build the forwarding
    /// endpoint, mint a fresh id, and insert the entry as one atomic step.
    pub fn create(&self, backend: &BackendConnection) -> Arc<Session> {
        self.insert(backend.name(), backend.create_forwarding_endpoint())
    }

    fn insert(&self, server_name: &str, endpoint: ForwardingEndpoint) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session {
            id: id.clone(),
            server_name: server_name.to_string(),
            endpoint,
            last_activity: Mutex::new(Instant::now()),
        });
        self.sessions.insert(id.clone(), Arc::clone(&session));
        debug!(session_id = %id, server = %server_name, "Session created");
        session
    }

    /// Remove a session; terminal. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                debug!(session_id = %id, server = %session.server_name, "Session closed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session idle longer than the threshold.
    ///
    /// Re-checks idleness under the removal so a request racing the scan
    /// keeps its session; a non-idle session is never reported purged.
    pub fn sweep(&self, idle_timeout: Duration) -> SweepReport {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for id in expired {
            let removed = self
                .sessions
                .remove_if(&id, |_, session| session.idle_for() > idle_timeout);
            if let Some((_, session)) = removed {
                info!(
                    session_id = %id,
                    server = %session.server_name,
                    idle_secs = session.idle_for().as_secs(),
                    "Closing idle session"
                );
                purged += 1;
            }
        }

        SweepReport {
            purged,
            remaining: self.sessions.len(),
        }
    }

    /// Session counts against the given idle threshold
    pub fn counts(&self, idle_timeout: Duration) -> SessionCounts {
        let total = self.sessions.len();
        let stale = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > idle_timeout)
            .count();
        SessionCounts {
            total,
            active: total - stale,
            stale,
        }
    }
}

/// Periodic idle sweep; runs until shutdown is signalled
pub async fn run_reaper(
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = registry.sweep(idle_timeout);
                if report.purged > 0 {
                    info!(
                        purged = report.purged,
                        remaining = report.remaining,
                        "Idle sweep finished"
                    );
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
