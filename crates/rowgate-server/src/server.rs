//! Server facade: lifecycle, client connect/disconnect and admin access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use rowgate_core::{
    ClientIdentity, ConnectionFactory, ConnectionRequest, ServerConfig, User, epoch_millis,
};
use rowgate_pool::{ConnectionPools, PoolSettings};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admin::ServerAdmin;
use crate::broker::ConnectionBroker;
use crate::error::{ServerError, ServerResult};
use crate::interceptor::CallInterceptor;
use crate::log_level::LogLevelHandle;
use crate::maintenance::MaintenanceScheduler;
use crate::rate::RequestRateCounter;
use crate::registry::SessionRegistry;
use crate::session::Session;

pub struct EntityServer {
    server_name: String,
    port: u16,
    started_at: u64,
    admin_user: Option<User>,
    client_log_size: usize,
    client_logging_enabled: AtomicBool,
    connection_limit: Mutex<Option<usize>>,
    registry: Arc<SessionRegistry>,
    interceptor: Arc<CallInterceptor>,
    maintenance: Arc<MaintenanceScheduler>,
    /// Serializes the limit check with registration.
    connect_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    log_level: OnceLock<LogLevelHandle>,
}

impl EntityServer {
    /// Build the pools and start the background tasks.
    ///
    /// A pool that cannot be opened aborts startup; pools already opened
    /// are closed before the error is returned.
    pub async fn start(
        config: ServerConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> ServerResult<Arc<Self>> {
        config
            .validate()
            .map_err(|e| ServerError::InvalidConfiguration(e.to_string()))?;

        let pools = Arc::new(ConnectionPools::new(Arc::clone(&factory)));
        for pool_config in &config.pools {
            if let Err(e) = pools
                .create(pool_config.user(), PoolSettings::from(pool_config))
                .await
            {
                error!(user = %pool_config.username, error = %e, "failed to create connection pool");
                pools.close_all().await;
                return Err(e.into());
            }
        }

        let rate = Arc::new(RequestRateCounter::new(
            config.request_counter_interval(),
            config.warning_threshold(),
        ));
        let broker = Arc::new(ConnectionBroker::new(factory, pools));
        let interceptor = Arc::new(CallInterceptor::new(broker, Arc::clone(&rate)));
        let client_type_timeouts: HashMap<String, Duration> = config
            .client_type_timeouts
            .iter()
            .map(|(client_type, ms)| (client_type.clone(), Duration::from_millis(*ms)))
            .collect();
        let registry = Arc::new(SessionRegistry::new(
            config.connection_timeout(),
            client_type_timeouts,
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            Arc::clone(&registry),
            config.maintenance_interval(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let maintenance_task = {
            let maintenance = Arc::clone(&maintenance);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { maintenance.run(shutdown).await })
        };
        let rate_task = tokio::spawn(async move { rate.run(shutdown_rx).await });

        info!(
            server = %config.server_name,
            port = config.port,
            pools = config.pools.len(),
            "entity server started"
        );

        Ok(Arc::new(Self {
            server_name: config.server_name.clone(),
            port: config.port,
            started_at: epoch_millis(),
            admin_user: config.admin.as_ref().map(|admin| admin.user()),
            client_log_size: config.client_log_size,
            client_logging_enabled: AtomicBool::new(config.client_logging_enabled),
            connection_limit: Mutex::new(config.connection_limit),
            registry,
            interceptor,
            maintenance,
            connect_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(vec![maintenance_task, rate_task]),
            log_level: OnceLock::new(),
        }))
    }

    /// Open a session, or return the existing one when the request names
    /// a known client id with matching credentials.
    pub async fn connect(&self, request: ConnectionRequest) -> ServerResult<Arc<Session>> {
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        if let Some(existing) = self.existing_session(&request)? {
            return Ok(existing);
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        // Another connect for the same client id may have won the lock.
        if let Some(existing) = self.existing_session(&request)? {
            return Ok(existing);
        }
        if let Some(limit) = self.connection_limit() {
            if self.registry.len() >= limit {
                warn!(limit, user = %request.user, "connection limit reached");
                return Err(ServerError::ConnectionLimitReached(limit));
            }
        }
        if let Some(pool) = self.pools().get(&request.user.username).await {
            if pool.user() != &request.user {
                warn!(user = %request.user, "password does not match pool user");
                return Err(ServerError::Authentication(request.user.username));
            }
        }

        let identity = ClientIdentity {
            client_id: request.client_id.unwrap_or_else(Uuid::new_v4),
            user: request.user,
            client_type: request.client_type,
            client_host: request.client_host,
            created_at: epoch_millis(),
        };
        let session = Arc::new(Session::new(
            identity,
            Arc::clone(&self.interceptor),
            self.client_log_size,
            self.client_logging_enabled.load(Ordering::Relaxed),
        ));
        session.open().await?;
        if let Err(existing) = self.registry.insert(Arc::clone(&session)) {
            warn!(client_id = %existing.id(), "client id already connected, dropping duplicate session");
            session.close().await;
            return Ok(existing);
        }

        info!(
            client_id = %session.id(),
            client = %session.identity().log_identifier(),
            host = session.identity().client_host.as_deref().unwrap_or("-"),
            connections = self.registry.len(),
            "client connected"
        );
        Ok(session)
    }

    /// The live session registered under the request's client id, if any.
    /// Fails when the request's credentials do not match it.
    fn existing_session(&self, request: &ConnectionRequest) -> ServerResult<Option<Arc<Session>>> {
        let Some(existing) = request.client_id.and_then(|id| self.registry.get(id)) else {
            return Ok(None);
        };
        if existing.identity().user != request.user {
            warn!(client_id = %existing.id(), user = %request.user, "credentials do not match existing session");
            return Err(ServerError::Authentication(request.user.username.clone()));
        }
        Ok(existing.is_connected().then_some(existing))
    }

    /// Disconnect a client. Returns false when it was not connected.
    pub async fn disconnect(&self, client_id: Uuid) -> bool {
        match self.registry.remove(client_id) {
            Some(session) => session.close().await,
            None => false,
        }
    }

    pub fn session(&self, client_id: Uuid) -> ServerResult<Arc<Session>> {
        self.registry
            .get(client_id)
            .ok_or(ServerError::ClientNotFound(client_id))
    }

    /// Stop the background tasks, disconnect every client and close the
    /// pools. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(server = %self.server_name, "entity server shutting down");
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }

        let _guard = self.connect_lock.lock().await;
        for session in self.registry.snapshot() {
            self.registry.remove(session.id());
            session.close().await;
        }
        self.pools().close_all().await;
        info!(server = %self.server_name, "entity server stopped");
    }

    /// Privileged access for the configured admin user.
    pub fn admin(self: &Arc<Self>, user: &User) -> ServerResult<ServerAdmin> {
        match &self.admin_user {
            Some(admin) if admin == user => Ok(ServerAdmin::new(Arc::clone(self))),
            _ => {
                warn!(user = %user, "rejected admin access");
                Err(ServerError::Authentication(user.username.clone()))
            }
        }
    }

    /// Let admins adjust the process log filter. Only the first handle
    /// attached is kept.
    pub fn attach_log_level(&self, handle: LogLevelHandle) {
        if self.log_level.set(handle).is_err() {
            warn!("log level handle already attached");
        }
    }

    pub(crate) fn log_level(&self) -> ServerResult<&LogLevelHandle> {
        self.log_level
            .get()
            .ok_or_else(|| ServerError::Unsupported("runtime log level control is not enabled".into()))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when shutdown begins.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_limit(&self) -> Option<usize> {
        *self
            .connection_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_connection_limit(&self, limit: Option<usize>) {
        *self
            .connection_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = limit;
    }

    pub(crate) fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub(crate) fn interceptor(&self) -> &Arc<CallInterceptor> {
        &self.interceptor
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceScheduler> {
        &self.maintenance
    }

    pub(crate) fn rate(&self) -> &Arc<RequestRateCounter> {
        self.interceptor.rate()
    }

    pub(crate) fn pools(&self) -> &Arc<ConnectionPools> {
        self.interceptor.broker().pools()
    }
}

impl std::fmt::Debug for EntityServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityServer")
            .field("server_name", &self.server_name)
            .field("port", &self.port)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}
