pub mod bootstrap;
pub mod pool;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, OwnedSemaphorePermit};

pub use pool::{Db, DbKind};

use crate::agent::registry::AgentRegistry;
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::recording::cleanup::CleanupHandle;
use crate::recording::storage::RecordingStorage;

/// Milliseconds since the unix epoch; the storage representation for every
/// timestamp column.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub audit: AuditLogger,
    pub registry: Arc<AgentRegistry>,
    pub storage: Arc<dyn RecordingStorage>,
    pub cleanup: Arc<CleanupHandle>,
    pub conn_guard: Arc<ConnectionGuard>,
    pub master_key: [u8; 32],
    pub kube: Option<kube::Client>,
}

/// Caps concurrent interactive query connections independently of the pool,
/// so a burst of operator queries cannot starve the server's own store.
pub struct ConnectionGuard {
    semaphore: Arc<Semaphore>,
}

impl ConnectionGuard {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max.max(1))),
        }
    }

    /// Wait up to `wait` for a slot. `None` means the guard is saturated.
    pub async fn acquire(&self, wait: Duration) -> Option<OwnedSemaphorePermit> {
        tokio::time::timeout(wait, self.semaphore.clone().acquire_owned())
            .await
            .ok()?
            .ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_guard_caps_acquisitions() {
        let guard = ConnectionGuard::new(2);
        let a = guard.acquire(Duration::from_millis(10)).await;
        let b = guard.acquire(Duration::from_millis(10)).await;
        assert!(a.is_some() && b.is_some());

        let c = guard.acquire(Duration::from_millis(10)).await;
        assert!(c.is_none());

        drop(a);
        let d = guard.acquire(Duration::from_millis(100)).await;
        assert!(d.is_some());
    }
}
