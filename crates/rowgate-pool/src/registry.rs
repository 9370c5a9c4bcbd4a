//! Registry of connection pools keyed by username, each with its own
//! background cleanup task.

use std::collections::HashMap;
use std::sync::Arc;

use rowgate_core::{ConnectionFactory, User};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{PoolError, PoolResult};
use crate::pool::ConnectionPool;
use crate::settings::PoolSettings;

/// Per-pool cleanup task state.
struct CleanupSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ConnectionPools {
    factory: Arc<dyn ConnectionFactory>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    cleanups: RwLock<HashMap<String, CleanupSlot>>,
}

impl ConnectionPools {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            pools: RwLock::new(HashMap::new()),
            cleanups: RwLock::new(HashMap::new()),
        }
    }

    /// Open a pool for `user` and start its cleanup task.
    pub async fn create(
        &self,
        user: User,
        settings: PoolSettings,
    ) -> PoolResult<Arc<ConnectionPool>> {
        let username = user.username.clone();
        if self.pools.read().await.contains_key(&username) {
            return Err(PoolError::Duplicate(username));
        }

        let pool = Arc::new(ConnectionPool::open(user, settings, Arc::clone(&self.factory)).await?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            runner.run_cleanup(shutdown_rx).await;
        });

        self.pools
            .write()
            .await
            .insert(username.clone(), Arc::clone(&pool));
        self.cleanups.write().await.insert(
            username.clone(),
            CleanupSlot {
                handle,
                shutdown_tx,
            },
        );
        info!(user = %username, "connection pool registered");
        Ok(pool)
    }

    pub async fn get(&self, username: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.read().await.get(username).cloned()
    }

    pub async fn require(&self, username: &str) -> PoolResult<Arc<ConnectionPool>> {
        self.get(username)
            .await
            .ok_or_else(|| PoolError::NotFound(username.to_string()))
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.pools.read().await.contains_key(username)
    }

    /// Usernames with a pool, sorted.
    pub async fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.pools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.read().await.is_empty()
    }

    /// Stop every cleanup task and close every pool. Idempotent.
    pub async fn close_all(&self) {
        let slots: Vec<(String, CleanupSlot)> = self.cleanups.write().await.drain().collect();
        for (username, slot) in slots {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            debug!(user = %username, "pool cleanup task stopped");
        }

        let pools: Vec<Arc<ConnectionPool>> =
            self.pools.write().await.drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
        info!("all connection pools closed");
    }
}

impl std::fmt::Debug for ConnectionPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPools").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgate_core::memory::MemoryDatabase;

    fn registry(db: &MemoryDatabase) -> ConnectionPools {
        ConnectionPools::new(Arc::new(db.factory()))
    }

    fn small() -> PoolSettings {
        PoolSettings {
            minimum_size: 1,
            maximum_size: 2,
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let db = MemoryDatabase::new();
        let pools = registry(&db);
        pools.create(User::new("scott", "tiger"), small()).await.unwrap();
        pools.create(User::new("adams", "x"), small()).await.unwrap();

        assert!(pools.contains("scott").await);
        assert_eq!(pools.usernames().await, ["adams", "scott"]);
        assert!(pools.get("nobody").await.is_none());
        assert!(matches!(
            pools.require("nobody").await,
            Err(PoolError::NotFound(_))
        ));
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn duplicate_rejected() {
        let db = MemoryDatabase::new();
        let pools = registry(&db);
        pools.create(User::new("scott", "tiger"), small()).await.unwrap();
        let err = pools
            .create(User::new("scott", "tiger"), small())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Duplicate(_)));
    }

    #[tokio::test]
    async fn create_fails_when_backend_down() {
        let db = MemoryDatabase::new();
        db.set_available(false);
        let pools = registry(&db);
        assert!(pools.create(User::new("scott", "tiger"), small()).await.is_err());
        assert!(pools.is_empty().await);
    }

    #[tokio::test]
    async fn close_all_closes_pools() {
        let db = MemoryDatabase::new();
        let pools = registry(&db);
        let pool = pools.create(User::new("scott", "tiger"), small()).await.unwrap();
        pools.close_all().await;
        pools.close_all().await;
        assert!(pool.is_closed());
        assert_eq!(pools.len().await, 0);
    }
}
