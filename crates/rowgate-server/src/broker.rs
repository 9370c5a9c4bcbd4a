//! Connection broker: picks a dedicated or pooled backend connection for a
//! session and decides what happens to it after each call.
//!
//! # Architecture
//!
//! ```text
//! acquire(user, held)
//!   → enabled pool for user → stale dedicated conn discarded, checkout from pool
//!   → no pool               → reuse held dedicated conn if valid, else create one
//!
//! release(conn)
//!   → pooled, no transaction   → checked back in
//!   → pooled, transaction open → stays pinned to the session
//!   → dedicated                → stays bound to the session
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use rowgate_core::{ConnectionFactory, EntityConnection, Operation, User};
use rowgate_pool::{ConnectionPool, ConnectionPools, PooledConnection};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// The backend connection a session currently holds.
#[derive(Debug)]
pub enum BackendConnection {
    Dedicated(Box<dyn EntityConnection>),
    Pooled(PooledConnection),
}

impl BackendConnection {
    pub fn is_pooled(&self) -> bool {
        matches!(self, BackendConnection::Pooled(_))
    }

    /// Checkout retries needed to obtain this connection (pooled only).
    pub fn retries(&self) -> u32 {
        match self {
            BackendConnection::Dedicated(_) => 0,
            BackendConnection::Pooled(conn) => conn.retries(),
        }
    }
}

impl Deref for BackendConnection {
    type Target = dyn EntityConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            BackendConnection::Dedicated(conn) => &**conn,
            BackendConnection::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for BackendConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            BackendConnection::Dedicated(conn) => &mut **conn,
            BackendConnection::Pooled(conn) => &mut **conn,
        }
    }
}

pub struct ConnectionBroker {
    factory: Arc<dyn ConnectionFactory>,
    pools: Arc<ConnectionPools>,
}

impl ConnectionBroker {
    pub fn new(factory: Arc<dyn ConnectionFactory>, pools: Arc<ConnectionPools>) -> Self {
        Self { factory, pools }
    }

    pub fn pools(&self) -> &Arc<ConnectionPools> {
        &self.pools
    }

    /// The user's pool, if one exists and is enabled.
    async fn enabled_pool(&self, username: &str) -> Option<Arc<ConnectionPool>> {
        self.pools
            .get(username)
            .await
            .filter(|pool| pool.is_enabled() && !pool.is_closed())
    }

    async fn create_dedicated(&self, user: &User) -> ServerResult<BackendConnection> {
        let conn = self.factory.connect(user).await.map_err(|e| {
            warn!(user = %user.username, error = %e, "failed to create dedicated connection");
            ServerError::ConnectionUnavailable(e.unwrap_envelope().to_string())
        })?;
        debug!(user = %user.username, "created dedicated connection");
        Ok(BackendConnection::Dedicated(conn))
    }

    /// Connection to hold from session creation on. Sessions of pooled
    /// users hold nothing until their first call.
    pub async fn open(&self, user: &User) -> ServerResult<Option<BackendConnection>> {
        if self.enabled_pool(&user.username).await.is_some() {
            return Ok(None);
        }
        self.create_dedicated(user).await.map(Some)
    }

    /// Obtain a usable connection for `user`, given whatever the session
    /// currently holds.
    pub async fn acquire(
        &self,
        user: &User,
        held: Option<BackendConnection>,
    ) -> ServerResult<BackendConnection> {
        // A connection in the middle of a transaction is never swapped out.
        let held = match held {
            Some(conn) if conn.is_transaction_open() => return Ok(conn),
            other => other,
        };

        if let Some(pool) = self.enabled_pool(&user.username).await {
            match held {
                Some(BackendConnection::Pooled(conn)) => {
                    return Ok(BackendConnection::Pooled(conn));
                }
                Some(BackendConnection::Dedicated(mut stale)) => {
                    debug!(user = %user.username, "discarding dedicated connection in favour of pool");
                    stale.disconnect().await;
                }
                None => {}
            }
            let conn = pool.checkout().await?;
            return Ok(BackendConnection::Pooled(conn));
        }

        match held {
            Some(BackendConnection::Dedicated(mut conn)) => {
                if conn.is_valid().await {
                    return Ok(BackendConnection::Dedicated(conn));
                }
                debug!(user = %user.username, "replacing invalid dedicated connection");
                conn.disconnect().await;
            }
            Some(BackendConnection::Pooled(conn)) => {
                // The pool was disabled or closed since this was checked out.
                self.return_to_pool(conn).await;
            }
            None => {}
        }
        self.create_dedicated(user).await
    }

    /// Decide what the session keeps after a call.
    ///
    /// Returns the connection the session should go on holding: dedicated
    /// connections and pooled connections with an open transaction.
    pub async fn release(&self, conn: BackendConnection) -> Option<BackendConnection> {
        match conn {
            BackendConnection::Dedicated(_) => Some(conn),
            BackendConnection::Pooled(pooled) => {
                if pooled.is_transaction_open() {
                    return Some(BackendConnection::Pooled(pooled));
                }
                if let Some(BackendConnection::Pooled(refused)) = self.return_to_pool(pooled).await {
                    self.discard(refused).await;
                }
                None
            }
        }
    }

    async fn return_to_pool(&self, mut conn: PooledConnection) -> Option<BackendConnection> {
        match self.pools.get(conn.username()).await {
            Some(pool) => match pool.checkin(conn).await {
                Ok(()) => None,
                Err(refused) => Some(BackendConnection::Pooled(refused)),
            },
            None => {
                conn.disconnect().await;
                None
            }
        }
    }

    async fn discard(&self, mut conn: PooledConnection) {
        match self.pools.get(conn.username()).await {
            Some(pool) => pool.discard(conn).await,
            None => conn.disconnect().await,
        }
    }

    /// Tear down whatever a disconnecting session holds: roll back an open
    /// transaction, check pooled connections in, close dedicated ones.
    pub async fn close(&self, conn: Option<BackendConnection>) {
        let Some(mut conn) = conn else {
            return;
        };
        if conn.is_transaction_open() {
            if let Err(e) = conn.execute(Operation::RollbackTransaction).await {
                warn!(error = %e, "rollback on disconnect failed");
            }
        }
        match conn {
            BackendConnection::Dedicated(mut dedicated) => dedicated.disconnect().await,
            BackendConnection::Pooled(pooled) => {
                if let Some(BackendConnection::Pooled(refused)) = self.return_to_pool(pooled).await {
                    self.discard(refused).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBroker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgate_core::memory::MemoryDatabase;
    use rowgate_pool::PoolSettings;

    fn scott() -> User {
        User::new("scott", "tiger")
    }

    async fn broker(db: &MemoryDatabase, pooled: bool) -> ConnectionBroker {
        let factory: Arc<dyn ConnectionFactory> = Arc::new(db.factory());
        let pools = Arc::new(ConnectionPools::new(Arc::clone(&factory)));
        if pooled {
            pools
                .create(
                    scott(),
                    PoolSettings {
                        minimum_size: 0,
                        maximum_size: 2,
                        ..PoolSettings::default()
                    },
                )
                .await
                .unwrap();
        }
        ConnectionBroker::new(factory, pools)
    }

    #[tokio::test]
    async fn dedicated_connection_reused_while_valid() {
        let db = MemoryDatabase::new();
        let broker = broker(&db, false).await;

        let held = broker.open(&scott()).await.unwrap();
        assert!(matches!(held, Some(BackendConnection::Dedicated(_))));
        let conn = broker.acquire(&scott(), held).await.unwrap();
        let kept = broker.release(conn).await;
        assert!(kept.is_some());
        assert_eq!(db.connections_opened(), 1);
    }

    #[tokio::test]
    async fn invalid_dedicated_connection_replaced() {
        let db = MemoryDatabase::new();
        let broker = broker(&db, false).await;
        let held = broker.open(&scott()).await.unwrap();

        db.invalidate_connections();
        let mut conn = broker.acquire(&scott(), held).await.unwrap();
        assert!(conn.is_valid().await);
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn replacement_failure_is_connection_unavailable() {
        let db = MemoryDatabase::new();
        let broker = broker(&db, false).await;
        let held = broker.open(&scott()).await.unwrap();

        db.invalidate_connections();
        db.set_available(false);
        let err = broker.acquire(&scott(), held).await.unwrap_err();
        assert_eq!(err.kind(), "connection_unavailable");
    }

    #[tokio::test]
    async fn pooled_connection_returned_after_call() {
        let db = MemoryDatabase::new();
        let broker = broker(&db, true).await;
        assert!(broker.open(&scott()).await.unwrap().is_none());

        let conn = broker.acquire(&scott(), None).await.unwrap();
        assert!(conn.is_pooled());
        let pool = broker.pools().get("scott").await.unwrap();
        assert_eq!(pool.in_use().await, 1);

        assert!(broker.release(conn).await.is_none());
        assert_eq!(pool.in_use().await, 0);
    }

    #[tokio::test]
    async fn pooled_connection_pinned_during_transaction() {
        let db = MemoryDatabase::new();
        let broker = broker(&db, true).await;
        let mut conn = broker.acquire(&scott(), None).await.unwrap();
        conn.execute(Operation::BeginTransaction).await.unwrap();

        let pinned = broker.release(conn).await;
        assert!(matches!(pinned, Some(BackendConnection::Pooled(_))));

        broker.close(pinned).await;
        let pool = broker.pools().get("scott").await.unwrap();
        assert_eq!(pool.in_use().await, 0);
        assert_eq!(pool.available().await, 1);
    }

    #[tokio::test]
    async fn stale_dedicated_discarded_when_pool_enabled() {
        let db = MemoryDatabase::new();
        let broker = broker(&db, true).await;
        let pool = broker.pools().get("scott").await.unwrap();

        pool.set_enabled(false).await;
        let held = broker.open(&scott()).await.unwrap();
        assert!(matches!(held, Some(BackendConnection::Dedicated(_))));

        pool.set_enabled(true).await;
        let conn = broker.acquire(&scott(), held).await.unwrap();
        assert!(conn.is_pooled());
    }
}
