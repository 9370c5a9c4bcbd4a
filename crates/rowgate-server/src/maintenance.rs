//! Periodic sweep that reaps idle and broken sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use crate::registry::SessionRegistry;
use crate::session::SessionState;

pub struct MaintenanceScheduler {
    registry: Arc<SessionRegistry>,
    interval_ms: AtomicU64,
    interval_changed: Notify,
}

impl MaintenanceScheduler {
    pub fn new(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval_ms: AtomicU64::new(interval.as_millis().max(1) as u64),
            interval_changed: Notify::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Takes effect from the next tick; a running loop restarts its wait.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::Relaxed);
        self.interval_changed.notify_waiters();
    }

    /// One maintenance pass. Returns the number of sessions reaped.
    pub async fn sweep(&self) -> usize {
        let mut reaped = 0;
        for session in self.registry.snapshot() {
            if session.state() == SessionState::Disconnected {
                self.registry.remove_session(&session);
                continue;
            }
            if !session.is_connected() {
                continue;
            }
            let timeout = self.registry.timeout_for(&session.identity().client_type);
            if session.reap_if_stale(timeout).await.is_some() {
                self.registry.remove_session(&session);
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!(reaped, remaining = self.registry.len(), "maintenance sweep");
        }
        reaped
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval().as_millis() as u64,
            "maintenance scheduler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval()) => {
                    self.sweep().await;
                }
                _ = self.interval_changed.notified() => {
                    debug!(interval_ms = self.interval().as_millis() as u64, "maintenance interval changed");
                }
                _ = shutdown.changed() => {
                    info!("maintenance scheduler shutting down");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("interval", &self.interval())
            .finish_non_exhaustive()
    }
}
