//! Call interceptor: the single path every client operation takes.
//!
//! # Architecture
//!
//! ```text
//! Session::invoke(op)
//!   → lock session connection slot (calls serialized, FIFO)
//!   → mark active, enter active set, record access
//!   → CallTrace "op"
//!       ├─ getConnection (broker.acquire, "retries: n")
//!       └─ backend execute → envelope unwrapped
//!   → rate counter (request, slow call)
//!   → broker.release → pinned (open transaction) or returned to pool
//!   → leave active set, record exit, append trace to the call log
//! ```

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use rowgate_core::{CallTrace, Operation, Outcome};
use tracing::{Instrument, debug, warn};
use uuid::Uuid;

use crate::broker::{BackendConnection, ConnectionBroker};
use crate::error::{ServerError, ServerResult};
use crate::rate::RequestRateCounter;
use crate::session::Session;

/// Sessions with a call currently executing.
#[derive(Debug, Default)]
pub struct ActiveCalls {
    sessions: Mutex<HashSet<Uuid>>,
}

impl ActiveCalls {
    fn enter(&self, id: Uuid) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    fn exit(&self, id: Uuid) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts a call as pending from entry until it returns or is dropped.
struct PendingCall<'a>(&'a Session);

impl<'a> PendingCall<'a> {
    fn enter(session: &'a Session) -> Self {
        session.pending_calls.fetch_add(1, Ordering::SeqCst);
        Self(session)
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.0.pending_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Active-set membership for the executing part of a call.
struct ActiveGuard<'a> {
    session: &'a Session,
    active: &'a ActiveCalls,
}

impl<'a> ActiveGuard<'a> {
    fn enter(session: &'a Session, active: &'a ActiveCalls) -> Self {
        session.set_active(true);
        active.enter(session.id());
        Self { session, active }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.exit(self.session.id());
        self.session.set_active(false);
    }
}

pub struct CallInterceptor {
    broker: Arc<ConnectionBroker>,
    rate: Arc<RequestRateCounter>,
    active: ActiveCalls,
}

impl CallInterceptor {
    pub fn new(broker: Arc<ConnectionBroker>, rate: Arc<RequestRateCounter>) -> Self {
        Self {
            broker,
            rate,
            active: ActiveCalls::default(),
        }
    }

    pub fn broker(&self) -> &Arc<ConnectionBroker> {
        &self.broker
    }

    pub fn rate(&self) -> &Arc<RequestRateCounter> {
        &self.rate
    }

    pub fn active(&self) -> &ActiveCalls {
        &self.active
    }

    /// Run `operation` on behalf of `session`.
    pub async fn invoke(&self, session: &Session, operation: Operation) -> ServerResult<Outcome> {
        let _pending = PendingCall::enter(session);
        let span = tracing::debug_span!(
            "call",
            client = %session.identity().log_identifier(),
            method = operation.name(),
        );
        self.run(session, operation).instrument(span).await
    }

    async fn run(&self, session: &Session, operation: Operation) -> ServerResult<Outcome> {
        let mut slot = session.connection.lock().await;
        if !session.is_connected() {
            return Err(ServerError::NotConnected(session.id()));
        }

        let method = operation.name();
        let logged = operation.is_logged();
        let logging = session.logging_enabled();
        let arguments = if logging && logged {
            operation.summary()
        } else {
            String::new()
        };

        let active = ActiveGuard::enter(session, &self.active);
        session.record_access(method, &arguments);

        let mut trace = CallTrace::begin(method, arguments);
        let result = match self.ensure_connection(session, slot.take(), &mut trace).await {
            Ok(mut conn) => {
                let result = conn
                    .execute(operation)
                    .await
                    .map_err(|e| ServerError::from(e.unwrap_envelope()));
                let kept = self.broker.release(conn).await;
                session
                    .pinned
                    .store(kept.as_ref().is_some_and(|c| c.is_pooled()), Ordering::SeqCst);
                *slot = kept;
                result
            }
            Err(e) => Err(e),
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = trace.complete(error, None) {
            warn!(error = %e, "call trace completed twice");
        }
        self.rate.record_call(trace.duration());

        drop(active);
        session.record_exit(method);
        drop(slot);

        // Calls that entered with logging off carry no argument summary.
        if logged && logging {
            debug!(trace = %trace.render(0).trim_end(), "call completed");
            session.append_trace(trace);
        }
        result
    }

    /// Produce the connection for this call, recording the acquisition as a
    /// `getConnection` child of `trace`.
    async fn ensure_connection(
        &self,
        session: &Session,
        held: Option<BackendConnection>,
        trace: &mut CallTrace,
    ) -> ServerResult<BackendConnection> {
        let pinned = session.pinned.swap(false, Ordering::SeqCst);
        let held = match held {
            Some(conn) if conn.is_pooled() && !conn.is_transaction_open() => {
                self.broker.release(conn).await;
                if pinned {
                    return Err(ServerError::TransactionClosed(
                        session.identity().log_identifier(),
                    ));
                }
                None
            }
            other => other,
        };

        let mut child = CallTrace::begin("getConnection", "");
        let acquired = self
            .broker
            .acquire(&session.identity().user, held)
            .await;
        let (error, message) = match &acquired {
            Ok(conn) if conn.retries() > 0 => (None, Some(format!("retries: {}", conn.retries()))),
            Ok(_) => (None, None),
            Err(e) => (Some(e.to_string()), None),
        };
        if child.complete(error, message).is_ok() {
            if let Err(e) = trace.add_child(child) {
                warn!(error = %e, "could not attach connection trace");
            }
        }
        acquired
    }
}

impl std::fmt::Debug for CallInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInterceptor")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
