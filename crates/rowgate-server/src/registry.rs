//! Session registry and the idle-timeout policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use uuid::Uuid;

use crate::session::Session;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    connection_timeout_ms: AtomicU64,
    /// Per client type idle timeouts, taking precedence over the default.
    client_type_timeouts: RwLock<HashMap<String, Duration>>,
}

impl SessionRegistry {
    pub fn new(connection_timeout: Duration, client_type_timeouts: HashMap<String, Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connection_timeout_ms: AtomicU64::new(connection_timeout.as_millis() as u64),
            client_type_timeouts: RwLock::new(client_type_timeouts),
        }
    }

    /// Register `session`. A connected session already holding the same
    /// client id is never replaced; it is handed back instead.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&session.id()) {
            if existing.is_connected() && !Arc::ptr_eq(existing, &session) {
                return Err(Arc::clone(existing));
            }
        }
        sessions.insert(session.id(), session);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Remove `session` only if it is still the one registered under its id.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id());
                true
            }
            _ => false,
        }
    }

    /// Point-in-time copy of all registered sessions.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_connection_timeout(&self, timeout: Duration) {
        self.connection_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn client_type_timeouts(&self) -> HashMap<String, Duration> {
        self.client_type_timeouts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set or, with `None`, clear the timeout override for `client_type`.
    pub fn set_client_type_timeout(&self, client_type: &str, timeout: Option<Duration>) {
        let mut timeouts = self
            .client_type_timeouts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match timeout {
            Some(timeout) => {
                timeouts.insert(client_type.to_string(), timeout);
            }
            None => {
                timeouts.remove(client_type);
            }
        }
    }

    /// Effective idle timeout for sessions of `client_type`.
    pub fn timeout_for(&self, client_type: &str) -> Duration {
        self.client_type_timeouts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_type)
            .copied()
            .unwrap_or_else(|| self.connection_timeout())
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("connection_timeout", &self.connection_timeout())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_type_override_wins() {
        let registry = SessionRegistry::new(
            Duration::from_secs(120),
            HashMap::from([("batch".to_string(), Duration::from_secs(5))]),
        );
        assert_eq!(registry.timeout_for("batch"), Duration::from_secs(5));
        assert_eq!(registry.timeout_for("desktop"), Duration::from_secs(120));

        registry.set_connection_timeout(Duration::from_secs(30));
        registry.set_client_type_timeout("desktop", Some(Duration::from_secs(1)));
        registry.set_client_type_timeout("batch", None);
        assert_eq!(registry.timeout_for("batch"), Duration::from_secs(30));
        assert_eq!(registry.timeout_for("desktop"), Duration::from_secs(1));
        assert_eq!(registry.client_type_timeouts().len(), 1);
    }
}
