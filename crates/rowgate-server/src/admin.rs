//! Privileged server administration.
//!
//! Obtained through [`EntityServer::admin`] with the configured admin
//! credential. Pool tuning operations address a pool by username and fail
//! with `PoolNotFound` for users without one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rowgate_core::ClientLog;
use rowgate_pool::{ConnectionPool, PoolSettings, PoolStatistics};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{ServerError, ServerResult};
use crate::server::EntityServer;
use crate::session::{Session, SessionState};

/// One connected client as seen by the admin.
#[derive(Clone, Debug, Serialize)]
pub struct ClientInfo {
    pub client_id: Uuid,
    pub username: String,
    pub client_type: String,
    pub client_host: Option<String>,
    pub created_at: u64,
    pub state: SessionState,
    pub last_access_time: u64,
    pub last_exit_time: u64,
    pub logging_enabled: bool,
}

impl ClientInfo {
    fn of(session: &Session) -> Self {
        let identity = session.identity();
        Self {
            client_id: identity.client_id,
            username: identity.user.username.clone(),
            client_type: identity.client_type.clone(),
            client_host: identity.client_host.clone(),
            created_at: identity.created_at,
            state: session.state(),
            last_access_time: session.last_access_time(),
            last_exit_time: session.last_exit_time(),
            logging_enabled: session.logging_enabled(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub version: String,
    pub port: u16,
    pub started_at: u64,
    pub connection_count: usize,
    pub connection_limit: Option<usize>,
    pub pool_users: Vec<String>,
}

#[derive(Clone)]
pub struct ServerAdmin {
    server: Arc<EntityServer>,
}

impl ServerAdmin {
    pub(crate) fn new(server: Arc<EntityServer>) -> Self {
        Self { server }
    }

    fn session(&self, client_id: Uuid) -> ServerResult<Arc<Session>> {
        self.server.session(client_id)
    }

    async fn pool(&self, username: &str) -> ServerResult<Arc<ConnectionPool>> {
        Ok(self.server.pools().require(username).await?)
    }

    async fn pool_settings(&self, username: &str) -> ServerResult<PoolSettings> {
        Ok(self.pool(username).await?.settings().await)
    }

    // ── Clients ──────────────────────────────────────────────────────

    /// Connected clients, oldest first.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .server
            .registry()
            .snapshot()
            .iter()
            .map(|session| ClientInfo::of(session))
            .collect();
        clients.sort_by_key(|client| (client.created_at, client.client_id));
        clients
    }

    pub fn clients_of_type(&self, client_type: &str) -> Vec<ClientInfo> {
        self.clients()
            .into_iter()
            .filter(|client| client.client_type == client_type)
            .collect()
    }

    pub fn clients_of_user(&self, username: &str) -> Vec<ClientInfo> {
        self.clients()
            .into_iter()
            .filter(|client| client.username == username)
            .collect()
    }

    /// Distinct usernames of connected clients.
    pub fn users(&self) -> Vec<String> {
        self.server
            .registry()
            .snapshot()
            .iter()
            .map(|session| session.identity().user.username.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Clients with a call currently executing.
    pub fn active_connection_count(&self) -> usize {
        self.server.interceptor().active().len()
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    /// Disconnect clients. With `inactive_only`, only clients without a
    /// call in flight or queued whose idle time exceeds their client type's
    /// timeout are removed. Returns the number disconnected.
    pub async fn remove_connections(&self, inactive_only: bool) -> usize {
        let registry = self.server.registry();
        let mut removed = 0;
        for session in registry.snapshot() {
            if inactive_only {
                let timeout = registry.timeout_for(&session.identity().client_type);
                if session.is_active()
                    || session.pending_calls.load(Ordering::SeqCst) > 0
                    || session.idle_time() <= timeout
                {
                    continue;
                }
            }
            if self.server.disconnect(session.id()).await {
                removed += 1;
            }
        }
        info!(removed, inactive_only, "removed client connections");
        removed
    }

    /// Disconnect inactive clients that have exceeded their timeout.
    pub async fn disconnect_timed_out_clients(&self) -> usize {
        self.remove_connections(true).await
    }

    pub async fn disconnect_all_clients(&self) -> usize {
        self.remove_connections(false).await
    }

    /// Disconnect one client. Returns false when it was not connected.
    pub async fn disconnect(&self, client_id: Uuid) -> bool {
        info!(%client_id, "admin disconnect");
        self.server.disconnect(client_id).await
    }

    /// Distinct client types of connected clients.
    pub fn client_types(&self) -> Vec<String> {
        self.server
            .registry()
            .snapshot()
            .iter()
            .map(|session| session.identity().client_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn server_log(&self, client_id: Uuid) -> ServerResult<ClientLog> {
        Ok(self.session(client_id)?.client_log())
    }

    pub fn logging_enabled(&self, client_id: Uuid) -> ServerResult<bool> {
        Ok(self.session(client_id)?.logging_enabled())
    }

    pub fn set_logging_enabled(&self, client_id: Uuid, enabled: bool) -> ServerResult<()> {
        self.session(client_id)?.set_logging_enabled(enabled);
        Ok(())
    }

    // ── Server ───────────────────────────────────────────────────────

    pub async fn server_info(&self) -> ServerInfo {
        ServerInfo {
            server_name: self.server.server_name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            port: self.server.port(),
            started_at: self.server.started_at(),
            connection_count: self.server.connection_count(),
            connection_limit: self.server.connection_limit(),
            pool_users: self.pool_users().await,
        }
    }

    pub fn requests_per_second(&self) -> f64 {
        self.server.rate().requests_per_second()
    }

    pub fn warning_time_exceeded_per_second(&self) -> f64 {
        self.server.rate().slow_calls_per_second()
    }

    pub fn warning_threshold(&self) -> Duration {
        self.server.rate().warning_threshold()
    }

    pub fn set_warning_threshold(&self, threshold: Duration) {
        self.server.rate().set_warning_threshold(threshold);
    }

    pub fn connection_timeout(&self) -> Duration {
        self.server.registry().connection_timeout()
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.server.registry().set_connection_timeout(timeout);
    }

    pub fn client_type_timeouts(&self) -> HashMap<String, Duration> {
        self.server.registry().client_type_timeouts()
    }

    pub fn set_client_type_timeout(&self, client_type: &str, timeout: Option<Duration>) {
        self.server
            .registry()
            .set_client_type_timeout(client_type, timeout);
    }

    pub fn maintenance_interval(&self) -> Duration {
        self.server.maintenance().interval()
    }

    pub fn set_maintenance_interval(&self, interval: Duration) -> ServerResult<()> {
        if interval.is_zero() {
            return Err(ServerError::InvalidConfiguration(
                "maintenance interval must be positive".into(),
            ));
        }
        self.server.maintenance().set_interval(interval);
        Ok(())
    }

    pub fn connection_limit(&self) -> Option<usize> {
        self.server.connection_limit()
    }

    pub fn set_connection_limit(&self, limit: Option<usize>) {
        self.server.set_connection_limit(limit);
    }

    /// Current log filter directives.
    pub fn log_level(&self) -> ServerResult<String> {
        self.server.log_level()?.current()
    }

    pub fn set_log_level(&self, directives: &str) -> ServerResult<()> {
        self.server.log_level()?.set(directives)
    }

    pub async fn shutdown(&self) {
        self.server.shutdown().await;
    }

    // ── Pools ────────────────────────────────────────────────────────

    pub async fn pool_users(&self) -> Vec<String> {
        self.server.pools().usernames().await
    }

    pub async fn pool_enabled(&self, username: &str) -> ServerResult<bool> {
        Ok(self.pool(username).await?.is_enabled())
    }

    pub async fn set_pool_enabled(&self, username: &str, enabled: bool) -> ServerResult<()> {
        self.pool(username).await?.set_enabled(enabled).await;
        Ok(())
    }

    pub async fn pool_statistics(&self, username: &str, since: u64) -> ServerResult<PoolStatistics> {
        Ok(self.pool(username).await?.statistics(since).await)
    }

    pub async fn reset_pool_statistics(&self, username: &str) -> ServerResult<()> {
        self.pool(username).await?.reset_statistics().await;
        Ok(())
    }

    pub async fn collect_fine_grained_statistics(&self, username: &str) -> ServerResult<bool> {
        Ok(self.pool_settings(username).await?.collect_fine_grained)
    }

    pub async fn set_collect_fine_grained_statistics(
        &self,
        username: &str,
        collect: bool,
    ) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_collect_fine_grained(collect).await?)
    }

    pub async fn minimum_pool_size(&self, username: &str) -> ServerResult<usize> {
        Ok(self.pool_settings(username).await?.minimum_size)
    }

    pub async fn set_minimum_pool_size(&self, username: &str, size: usize) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_minimum_size(size).await?)
    }

    pub async fn maximum_pool_size(&self, username: &str) -> ServerResult<usize> {
        Ok(self.pool_settings(username).await?.maximum_size)
    }

    pub async fn set_maximum_pool_size(&self, username: &str, size: usize) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_maximum_size(size).await?)
    }

    pub async fn pool_checkout_timeout(&self, username: &str) -> ServerResult<Duration> {
        Ok(self.pool_settings(username).await?.checkout_timeout)
    }

    pub async fn set_pool_checkout_timeout(
        &self,
        username: &str,
        timeout: Duration,
    ) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_checkout_timeout(timeout).await?)
    }

    pub async fn maximum_retry_wait_period(&self, username: &str) -> ServerResult<Duration> {
        Ok(self.pool_settings(username).await?.maximum_retry_wait)
    }

    pub async fn set_maximum_retry_wait_period(
        &self,
        username: &str,
        wait: Duration,
    ) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_maximum_retry_wait(wait).await?)
    }

    pub async fn pool_idle_timeout(&self, username: &str) -> ServerResult<Duration> {
        Ok(self.pool_settings(username).await?.idle_timeout)
    }

    pub async fn set_pool_idle_timeout(&self, username: &str, timeout: Duration) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_idle_timeout(timeout).await?)
    }

    pub async fn pool_cleanup_interval(&self, username: &str) -> ServerResult<Duration> {
        Ok(self.pool_settings(username).await?.cleanup_interval)
    }

    pub async fn set_pool_cleanup_interval(
        &self,
        username: &str,
        interval: Duration,
    ) -> ServerResult<()> {
        Ok(self.pool(username).await?.set_cleanup_interval(interval).await?)
    }
}

impl std::fmt::Debug for ServerAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAdmin")
            .field("server", &self.server.server_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgate_core::config::AdminConfig;
    use rowgate_core::memory::MemoryDatabase;
    use rowgate_core::{ConnectionRequest, Entity, PoolConfig, ServerConfig, User};

    async fn admin(db: &MemoryDatabase) -> (Arc<EntityServer>, ServerAdmin) {
        let config = ServerConfig {
            admin: Some(AdminConfig {
                username: "admin".into(),
                password: "secret".into(),
            }),
            pools: vec![PoolConfig {
                username: "scott".into(),
                password: "tiger".into(),
                minimum_size: 0,
                maximum_size: 2,
                ..PoolConfig::default()
            }],
            ..ServerConfig::default()
        };
        let server = EntityServer::start(config, Arc::new(db.factory()))
            .await
            .unwrap();
        let admin = server.admin(&User::new("admin", "secret")).unwrap();
        (server, admin)
    }

    #[tokio::test(start_paused = true)]
    async fn lists_and_filters_clients() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;
        server
            .connect(ConnectionRequest::new(User::new("scott", "tiger"), "desktop"))
            .await
            .unwrap();
        server
            .connect(ConnectionRequest::new(User::new("blake", "pw"), "batch").with_host("10.0.0.7"))
            .await
            .unwrap();

        assert_eq!(admin.connection_count(), 2);
        assert_eq!(admin.users(), vec!["blake".to_string(), "scott".to_string()]);
        let batch = admin.clients_of_type("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].client_host.as_deref(), Some("10.0.0.7"));
        assert_eq!(admin.clients_of_user("scott").len(), 1);
        assert_eq!(admin.active_connection_count(), 0);
        assert_eq!(admin.client_types(), vec!["batch".to_string(), "desktop".to_string()]);

        // Fresh sessions have not timed out yet.
        assert_eq!(admin.remove_connections(true).await, 0);

        admin.set_client_type_timeout("batch", Some(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(admin.disconnect_timed_out_clients().await, 1);
        assert_eq!(admin.clients_of_type("batch").len(), 0);

        assert_eq!(admin.disconnect_all_clients().await, 1);
        assert_eq!(admin.connection_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_removal_skips_client_with_call_in_flight() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;
        admin.set_connection_timeout(Duration::from_secs(1));
        let session = server
            .connect(ConnectionRequest::new(User::new("blake", "pw"), "desktop"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        db.set_latency(Duration::from_secs(5));
        let call = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.select_all("emp").await })
        };
        while !session.is_active() {
            tokio::task::yield_now().await;
        }
        assert_eq!(admin.remove_connections(true).await, 0);

        call.await.unwrap().unwrap();
        assert_eq!(admin.remove_connections(true).await, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn disconnects_single_client() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;
        let session = server
            .connect(ConnectionRequest::new(User::new("blake", "pw"), "desktop"))
            .await
            .unwrap();

        assert!(admin.disconnect(session.id()).await);
        assert!(!admin.disconnect(session.id()).await);
        assert!(!session.is_connected());
        assert_eq!(admin.connection_count(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn server_log_follows_logging_toggle() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;
        let session = server
            .connect(ConnectionRequest::new(User::new("scott", "tiger"), "desktop"))
            .await
            .unwrap();

        session
            .insert(vec![Entity::new("emp").with_key("id", 1).with_value("name", "KING")])
            .await
            .unwrap();
        assert!(admin.server_log(session.id()).unwrap().entries.is_empty());

        admin.set_logging_enabled(session.id(), true).unwrap();
        assert!(admin.logging_enabled(session.id()).unwrap());
        session.select_all("emp").await.unwrap();
        let log = admin.server_log(session.id()).unwrap();
        assert_eq!(log.entries.len(), 1);
        assert_eq!(log.entries[0].method(), "selectAll");
        assert_eq!(log.entries[0].children()[0].method(), "getConnection");

        let missing = admin.server_log(Uuid::new_v4()).unwrap_err();
        assert_eq!(missing.kind(), "client_not_found");
        server.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logging_enabled_mid_call_starts_with_next_call() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;
        let session = server
            .connect(ConnectionRequest::new(User::new("blake", "pw"), "desktop"))
            .await
            .unwrap();

        db.set_latency(Duration::from_millis(100));
        let call = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.select_all("emp").await })
        };
        while !session.is_active() {
            tokio::task::yield_now().await;
        }
        admin.set_logging_enabled(session.id(), true).unwrap();
        call.await.unwrap().unwrap();
        assert!(admin.server_log(session.id()).unwrap().entries.is_empty());

        session.select_all("emp").await.unwrap();
        let log = admin.server_log(session.id()).unwrap();
        assert_eq!(log.entries.len(), 1);
        assert!(!log.entries[0].arguments().is_empty());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn pool_tuning_round_trips() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;

        assert_eq!(admin.pool_users().await, vec!["scott".to_string()]);
        admin.set_maximum_pool_size("scott", 5).await.unwrap();
        admin.set_minimum_pool_size("scott", 1).await.unwrap();
        admin
            .set_pool_checkout_timeout("scott", Duration::from_millis(750))
            .await
            .unwrap();
        admin
            .set_maximum_retry_wait_period("scott", Duration::from_millis(20))
            .await
            .unwrap();
        admin
            .set_pool_idle_timeout("scott", Duration::from_secs(10))
            .await
            .unwrap();
        admin
            .set_pool_cleanup_interval("scott", Duration::from_secs(3))
            .await
            .unwrap();
        admin
            .set_collect_fine_grained_statistics("scott", true)
            .await
            .unwrap();

        assert_eq!(admin.maximum_pool_size("scott").await.unwrap(), 5);
        assert_eq!(admin.minimum_pool_size("scott").await.unwrap(), 1);
        assert_eq!(
            admin.pool_checkout_timeout("scott").await.unwrap(),
            Duration::from_millis(750)
        );
        assert_eq!(
            admin.maximum_retry_wait_period("scott").await.unwrap(),
            Duration::from_millis(20)
        );
        assert_eq!(
            admin.pool_idle_timeout("scott").await.unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(
            admin.pool_cleanup_interval("scott").await.unwrap(),
            Duration::from_secs(3)
        );
        assert!(admin.collect_fine_grained_statistics("scott").await.unwrap());

        let err = admin.set_minimum_pool_size("scott", 9).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_configuration");
        let err = admin.maximum_pool_size("blake").await.unwrap_err();
        assert_eq!(err.kind(), "pool_not_found");

        admin.set_pool_enabled("scott", false).await.unwrap();
        assert!(!admin.pool_enabled("scott").await.unwrap());
        let stats = admin.pool_statistics("scott", 0).await.unwrap();
        assert!(!stats.enabled);
        admin.reset_pool_statistics("scott").await.unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn server_settings_round_trip() {
        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;

        admin.set_connection_timeout(Duration::from_secs(5));
        admin.set_maintenance_interval(Duration::from_secs(1)).unwrap();
        let err = admin.set_maintenance_interval(Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), "invalid_configuration");
        let err = admin
            .set_maximum_retry_wait_period("scott", Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_configuration");
        admin.set_warning_threshold(Duration::from_millis(15));
        admin.set_connection_limit(Some(3));
        admin.set_client_type_timeout("batch", Some(Duration::from_secs(2)));

        assert_eq!(admin.connection_timeout(), Duration::from_secs(5));
        assert_eq!(admin.maintenance_interval(), Duration::from_secs(1));
        assert_eq!(admin.warning_threshold(), Duration::from_millis(15));
        assert_eq!(admin.connection_limit(), Some(3));
        assert_eq!(
            admin.client_type_timeouts().get("batch"),
            Some(&Duration::from_secs(2))
        );

        let info = admin.server_info().await;
        assert_eq!(info.server_name, "rowgate");
        assert_eq!(info.connection_limit, Some(3));
        assert_eq!(info.pool_users, vec!["scott".to_string()]);
        assert_eq!(admin.requests_per_second(), 0.0);
        assert_eq!(admin.warning_time_exceeded_per_second(), 0.0);

        admin.shutdown().await;
        assert!(server.is_shutting_down());
    }

    #[tokio::test]
    async fn log_level_requires_attached_handle() {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::{EnvFilter, reload};

        let db = MemoryDatabase::new();
        let (server, admin) = admin(&db).await;
        assert_eq!(admin.log_level().unwrap_err().kind(), "unsupported");

        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(layer);
        server.attach_log_level(crate::LogLevelHandle::new(handle));

        admin.set_log_level("debug").unwrap();
        assert!(admin.log_level().unwrap().contains("debug"));
        assert_eq!(
            admin.set_log_level("rowgate=loud").unwrap_err().kind(),
            "invalid_configuration"
        );
        server.shutdown().await;
    }
}
