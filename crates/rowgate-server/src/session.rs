//! Client sessions.
//!
//! A session owns the client's identity, the backend connection it holds
//! between calls (if any) and its call log. Calls are serialized through
//! the connection mutex, which is held for the whole call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rowgate_core::{
    CallLog, CallTrace, ClientIdentity, ClientLog, Criteria, Entity, EntityKey, Operation,
    Outcome, ReportRequest, ReportResult, Value,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::broker::BackendConnection;
use crate::error::{ServerError, ServerResult};
use crate::interceptor::CallInterceptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    /// Connected with a call in flight.
    Active,
    Disconnected,
}

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const DISCONNECTED: u8 = 2;

/// Why the maintenance sweep reaped a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReapReason {
    InvalidConnection,
    Idle,
}

pub struct Session {
    identity: ClientIdentity,
    interceptor: Arc<CallInterceptor>,
    /// Held for the whole duration of a call.
    pub(crate) connection: tokio::sync::Mutex<Option<BackendConnection>>,
    /// Set when a pooled connection was kept because a transaction is open.
    pub(crate) pinned: AtomicBool,
    log: Mutex<CallLog>,
    last_activity: Mutex<Instant>,
    /// Calls entered, including those still waiting for the connection.
    pub(crate) pending_calls: AtomicUsize,
    active: AtomicBool,
    state: AtomicU8,
}

impl Session {
    pub(crate) fn new(
        identity: ClientIdentity,
        interceptor: Arc<CallInterceptor>,
        log_size: usize,
        logging_enabled: bool,
    ) -> Self {
        Self {
            identity,
            interceptor,
            connection: tokio::sync::Mutex::new(None),
            pinned: AtomicBool::new(false),
            log: Mutex::new(CallLog::new(log_size, logging_enabled)),
            last_activity: Mutex::new(Instant::now()),
            pending_calls: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            state: AtomicU8::new(CONNECTING),
        }
    }

    /// Bind the initial backend connection and mark the session connected.
    pub(crate) async fn open(&self) -> ServerResult<()> {
        let initial = self.interceptor.broker().open(&self.identity.user).await?;
        *self.connection.lock().await = initial;
        let _ = self.state.compare_exchange(
            CONNECTING,
            CONNECTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    /// Graceful teardown. Waits for an in-flight call to finish. Returns
    /// false when the session was already disconnected.
    pub(crate) async fn close(&self) -> bool {
        if self.state.swap(DISCONNECTED, Ordering::SeqCst) == DISCONNECTED {
            return false;
        }
        let held = self.connection.lock().await.take();
        self.pinned.store(false, Ordering::SeqCst);
        self.interceptor.broker().close(held).await;
        info!(
            client_id = %self.identity.client_id,
            client = %self.identity.log_identifier(),
            "client disconnected"
        );
        true
    }

    /// Disconnect the session if it is idle and either its backend
    /// connection is invalid or it has been idle longer than `timeout`.
    /// Sessions with a call in flight or queued are left alone, as are
    /// sessions holding an open transaction (unless the connection is
    /// invalid).
    pub(crate) async fn reap_if_stale(&self, timeout: Duration) -> Option<ReapReason> {
        if self.pending_calls.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let Ok(mut slot) = self.connection.try_lock() else {
            return None;
        };
        if !self.is_connected() {
            return None;
        }

        let idle = self.idle_time() > timeout;
        let reason = match slot.as_mut() {
            Some(conn) => {
                if !conn.is_valid().await {
                    Some(ReapReason::InvalidConnection)
                } else if conn.is_transaction_open() {
                    None
                } else {
                    idle.then_some(ReapReason::Idle)
                }
            }
            None => idle.then_some(ReapReason::Idle),
        };
        let reason = reason?;

        if self.state.swap(DISCONNECTED, Ordering::SeqCst) == DISCONNECTED {
            return None;
        }
        let held = slot.take();
        drop(slot);
        self.pinned.store(false, Ordering::SeqCst);
        self.interceptor.broker().close(held).await;
        info!(
            client_id = %self.identity.client_id,
            client = %self.identity.log_identifier(),
            reason = ?reason,
            "reaped client session"
        );
        Some(reason)
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.identity.client_id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            CONNECTING => SessionState::Connecting,
            DISCONNECTED => SessionState::Disconnected,
            _ if self.is_active() => SessionState::Active,
            _ => SessionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CONNECTED
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Time since the last call started or, before any call, since creation.
    pub fn idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn log(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_access(&self, method: &str, arguments: &str) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.log().record_access(method, arguments);
    }

    pub(crate) fn record_exit(&self, method: &str) {
        self.log().record_exit(method);
    }

    pub(crate) fn append_trace(&self, trace: CallTrace) {
        self.log().append(trace);
    }

    pub fn logging_enabled(&self) -> bool {
        self.log().is_enabled()
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.log().set_enabled(enabled);
    }

    /// Epoch milliseconds of the last call entry.
    pub fn last_access_time(&self) -> u64 {
        self.log().last_access_time()
    }

    /// Epoch milliseconds of the last call exit.
    pub fn last_exit_time(&self) -> u64 {
        self.log().last_exit_time()
    }

    pub fn client_log(&self) -> ClientLog {
        self.log()
            .snapshot(self.identity.client_id, self.identity.created_at)
    }

    // ── Client operations ────────────────────────────────────────────

    /// Run one operation through the call interceptor.
    pub async fn invoke(&self, operation: Operation) -> ServerResult<Outcome> {
        self.interceptor.invoke(self, operation).await
    }

    async fn call<T>(
        &self,
        operation: Operation,
        extract: impl FnOnce(Outcome) -> Option<T>,
    ) -> ServerResult<T> {
        let name = operation.name();
        let outcome = self.invoke(operation).await?;
        let got = outcome.kind();
        extract(outcome).ok_or_else(|| ServerError::UnexpectedOutcome {
            operation: name.to_string(),
            got: got.to_string(),
        })
    }

    async fn call_unit(&self, operation: Operation) -> ServerResult<()> {
        self.call(operation, |o| matches!(o, Outcome::Unit).then_some(()))
            .await
    }

    /// Whether the session is connected and its backend connection usable.
    pub async fn is_valid(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.call(Operation::IsValid, |o| match o {
            Outcome::Bool(valid) => Some(valid),
            _ => None,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn begin_transaction(&self) -> ServerResult<()> {
        self.call_unit(Operation::BeginTransaction).await
    }

    pub async fn commit_transaction(&self) -> ServerResult<()> {
        self.call_unit(Operation::CommitTransaction).await
    }

    pub async fn rollback_transaction(&self) -> ServerResult<()> {
        self.call_unit(Operation::RollbackTransaction).await
    }

    pub async fn is_transaction_open(&self) -> ServerResult<bool> {
        self.call(Operation::IsTransactionOpen, |o| match o {
            Outcome::Bool(open) => Some(open),
            _ => None,
        })
        .await
    }

    pub async fn insert(&self, entities: Vec<Entity>) -> ServerResult<Vec<EntityKey>> {
        self.call(Operation::Insert { entities }, |o| match o {
            Outcome::Keys(keys) => Some(keys),
            _ => None,
        })
        .await
    }

    pub async fn update(&self, entities: Vec<Entity>) -> ServerResult<Vec<Entity>> {
        self.call(Operation::Update { entities }, entities_of).await
    }

    pub async fn delete_by_keys(&self, keys: Vec<EntityKey>) -> ServerResult<usize> {
        self.call(Operation::DeleteByKeys { keys }, count_of).await
    }

    pub async fn delete(&self, criteria: Criteria) -> ServerResult<usize> {
        self.call(Operation::DeleteByCriteria { criteria }, count_of)
            .await
    }

    pub async fn select_single(&self, criteria: Criteria) -> ServerResult<Entity> {
        self.call(Operation::SelectSingle { criteria }, entity_of)
            .await
    }

    pub async fn select_by_key(&self, key: EntityKey) -> ServerResult<Entity> {
        self.call(Operation::SelectByKey { key }, entity_of).await
    }

    pub async fn select_many(&self, criteria: Criteria) -> ServerResult<Vec<Entity>> {
        self.call(Operation::SelectMany { criteria }, entities_of)
            .await
    }

    pub async fn select_many_by_keys(&self, keys: Vec<EntityKey>) -> ServerResult<Vec<Entity>> {
        self.call(Operation::SelectManyByKeys { keys }, entities_of)
            .await
    }

    pub async fn select_all(&self, entity_id: &str) -> ServerResult<Vec<Entity>> {
        self.call(
            Operation::SelectAll {
                entity_id: entity_id.to_string(),
            },
            entities_of,
        )
        .await
    }

    pub async fn select_row_count(&self, criteria: Criteria) -> ServerResult<usize> {
        self.call(Operation::SelectRowCount { criteria }, count_of)
            .await
    }

    pub async fn select_property_values(
        &self,
        entity_id: &str,
        property: &str,
        order: bool,
    ) -> ServerResult<Vec<Value>> {
        self.call(
            Operation::SelectPropertyValues {
                entity_id: entity_id.to_string(),
                property: property.to_string(),
                order,
            },
            values_of,
        )
        .await
    }

    pub async fn select_dependent_entities(
        &self,
        entities: Vec<Entity>,
    ) -> ServerResult<BTreeMap<String, Vec<Entity>>> {
        self.call(Operation::SelectDependentEntities { entities }, |o| match o {
            Outcome::Dependents(map) => Some(map),
            _ => None,
        })
        .await
    }

    pub async fn execute_procedure(
        &self,
        procedure_id: &str,
        arguments: Vec<Value>,
    ) -> ServerResult<()> {
        self.call_unit(Operation::ExecuteProcedure {
            procedure_id: procedure_id.to_string(),
            arguments,
        })
        .await
    }

    pub async fn execute_function(
        &self,
        function_id: &str,
        arguments: Vec<Value>,
    ) -> ServerResult<Vec<Value>> {
        self.call(
            Operation::ExecuteFunction {
                function_id: function_id.to_string(),
                arguments,
            },
            values_of,
        )
        .await
    }

    pub async fn write_blob(&self, key: EntityKey, property: &str, data: Vec<u8>) -> ServerResult<()> {
        self.call_unit(Operation::WriteBlob {
            key,
            property: property.to_string(),
            data,
        })
        .await
    }

    pub async fn read_blob(&self, key: EntityKey, property: &str) -> ServerResult<Vec<u8>> {
        self.call(
            Operation::ReadBlob {
                key,
                property: property.to_string(),
            },
            |o| match o {
                Outcome::Blob(data) => Some(data),
                _ => None,
            },
        )
        .await
    }

    pub async fn fill_report(&self, report: ReportRequest) -> ServerResult<ReportResult> {
        self.call(Operation::FillReport { report }, |o| match o {
            Outcome::Report(result) => Some(result),
            _ => None,
        })
        .await
    }
}

fn entity_of(outcome: Outcome) -> Option<Entity> {
    match outcome {
        Outcome::Entity(entity) => Some(entity),
        _ => None,
    }
}

fn entities_of(outcome: Outcome) -> Option<Vec<Entity>> {
    match outcome {
        Outcome::Entities(entities) => Some(entities),
        _ => None,
    }
}

fn count_of(outcome: Outcome) -> Option<usize> {
    match outcome {
        Outcome::Count(count) => Some(count),
        _ => None,
    }
}

fn values_of(outcome: Outcome) -> Option<Vec<Value>> {
    match outcome {
        Outcome::Values(values) => Some(values),
        _ => None,
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.identity.client_id)
            .field("client", &self.identity.log_identifier())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
