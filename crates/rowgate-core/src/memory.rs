//! In-memory entity backend.
//!
//! Serves the daemon when no external database is wired in and backs the
//! test suites. Rows live in a shared `MemoryDatabase`; each
//! `MemoryConnection` works on a private copy while a transaction is open
//! and publishes it on commit (last writer wins).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{ConnectionFactory, EntityConnection};
use crate::error::{BackendError, BackendResult};
use crate::operation::{Operation, Outcome};
use crate::types::{Criteria, Entity, EntityKey, Field, ReportRequest, ReportResult, User, Value};

/// A stored procedure or function.
pub type Routine = Arc<dyn Fn(&[Value]) -> BackendResult<Vec<Value>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Store {
    tables: BTreeMap<String, Vec<Entity>>,
    blobs: HashMap<String, Vec<u8>>,
    next_id: i64,
}

struct Shared {
    store: Mutex<Store>,
    routines: RwLock<HashMap<String, Routine>>,
    credentials: RwLock<Option<HashMap<String, String>>>,
    available: AtomicBool,
    generation: AtomicU64,
    latency_ms: AtomicU64,
    connect_latency_ms: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

/// Shared in-memory database. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store {
                    next_id: 1,
                    ..Store::default()
                }),
                routines: RwLock::new(HashMap::new()),
                credentials: RwLock::new(None),
                available: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                latency_ms: AtomicU64::new(0),
                connect_latency_ms: AtomicU64::new(0),
                connections_opened: AtomicU64::new(0),
                connections_closed: AtomicU64::new(0),
            }),
        }
    }

    pub fn factory(&self) -> MemoryConnectionFactory {
        MemoryConnectionFactory { db: self.clone() }
    }

    /// Register a procedure or function callable through
    /// `executeProcedure`/`executeFunction`.
    pub fn register_routine(
        &self,
        id: impl Into<String>,
        routine: impl Fn(&[Value]) -> BackendResult<Vec<Value>> + Send + Sync + 'static,
    ) {
        if let Ok(mut routines) = self.shared.routines.write() {
            routines.insert(id.into(), Arc::new(routine));
        }
    }

    /// Only accept connections for these users from now on.
    pub fn require_credentials(&self, users: &[User]) {
        if let Ok(mut credentials) = self.shared.credentials.write() {
            *credentials = Some(
                users
                    .iter()
                    .map(|u| (u.username.clone(), u.password.clone()))
                    .collect(),
            );
        }
    }

    /// Simulate the database going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Make every connection opened so far report itself invalid.
    pub fn invalidate_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Artificial delay applied to every executed operation.
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Artificial delay applied when opening a connection.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.shared
            .connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> u64 {
        self.shared.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.shared.connections_closed.load(Ordering::SeqCst)
    }

    pub fn row_count(&self, entity_id: &str) -> usize {
        self.shared
            .store
            .lock()
            .map(|store| store.tables.get(entity_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Insert rows directly, bypassing any connection.
    pub fn seed(&self, entities: Vec<Entity>) -> BackendResult<Vec<EntityKey>> {
        let mut store = lock(&self.shared.store)?;
        let mut working = store.clone();
        let keys = working.insert(entities)?;
        *store = working;
        Ok(keys)
    }

    fn routine(&self, id: &str) -> Option<Routine> {
        self.shared
            .routines
            .read()
            .ok()
            .and_then(|routines| routines.get(id).cloned())
    }

    fn check_credentials(&self, user: &User) -> BackendResult<()> {
        let credentials = self
            .shared
            .credentials
            .read()
            .map_err(|_| BackendError::Database("credential table poisoned".into()))?;
        match credentials.as_ref() {
            None => Ok(()),
            Some(known) if known.get(&user.username) == Some(&user.password) => Ok(()),
            Some(_) => Err(BackendError::Connection(format!(
                "login denied for user '{}'",
                user.username
            ))),
        }
    }

    fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.shared.latency_ms.load(Ordering::SeqCst))
    }
}

fn lock(store: &Mutex<Store>) -> BackendResult<std::sync::MutexGuard<'_, Store>> {
    store
        .lock()
        .map_err(|_| BackendError::Database("store lock poisoned".into()))
}

// ── Debug impl ───────────────────────────────────────────────────────

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("available", &self.is_available())
            .field("generation", &self.generation())
            .field("connections_opened", &self.connections_opened())
            .finish()
    }
}

// ── Factory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryConnectionFactory {
    db: MemoryDatabase,
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self, user: &User) -> BackendResult<Box<dyn EntityConnection>> {
        let delay = Duration::from_millis(self.db.shared.connect_latency_ms.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.db.is_available() {
            return Err(BackendError::Connection("database unavailable".into()));
        }
        self.db.check_credentials(user)?;
        self.db
            .shared
            .connections_opened
            .fetch_add(1, Ordering::SeqCst);
        tracing::debug!(user = %user.username, "opened in-memory connection");
        Ok(Box::new(MemoryConnection {
            db: self.db.clone(),
            username: user.username.clone(),
            generation: self.db.generation(),
            connected: true,
            transaction: None,
        }))
    }
}

// ── Connection ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    username: String,
    generation: u64,
    connected: bool,
    /// Private working copy while a transaction is open.
    transaction: Option<Store>,
}

impl MemoryConnection {
    fn valid(&self) -> bool {
        self.connected && self.generation == self.db.generation() && self.db.is_available()
    }

    /// Run `f` against a copy of the current store and publish the copy
    /// only on success, so a failing operation changes nothing.
    fn apply<R>(&mut self, f: impl FnOnce(&mut Store) -> BackendResult<R>) -> BackendResult<R> {
        match self.transaction.as_mut() {
            Some(working) => {
                let mut copy = working.clone();
                let result = f(&mut copy)?;
                *working = copy;
                Ok(result)
            }
            None => {
                let mut store = lock(&self.db.shared.store)?;
                let mut copy = store.clone();
                let result = f(&mut copy)?;
                *store = copy;
                Ok(result)
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Store) -> BackendResult<R>) -> BackendResult<R> {
        match self.transaction.as_ref() {
            Some(working) => f(working),
            None => f(&*lock(&self.db.shared.store)?),
        }
    }
}

#[async_trait]
impl EntityConnection for MemoryConnection {
    async fn execute(&mut self, operation: Operation) -> BackendResult<Outcome> {
        if !self.connected {
            return Err(BackendError::Connection("connection is closed".into()));
        }
        if !self.db.is_available() {
            return Err(BackendError::Connection("database unavailable".into()));
        }
        let latency = self.db.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match operation {
            Operation::IsValid => Ok(Outcome::Bool(self.valid())),
            Operation::BeginTransaction => {
                if self.transaction.is_some() {
                    return Err(BackendError::Transaction("transaction already open".into()));
                }
                let snapshot = lock(&self.db.shared.store)?.clone();
                self.transaction = Some(snapshot);
                Ok(Outcome::Unit)
            }
            Operation::CommitTransaction => {
                let working = self
                    .transaction
                    .take()
                    .ok_or_else(|| BackendError::Transaction("no open transaction".into()))?;
                *lock(&self.db.shared.store)? = working;
                Ok(Outcome::Unit)
            }
            Operation::RollbackTransaction => {
                self.transaction
                    .take()
                    .ok_or_else(|| BackendError::Transaction("no open transaction".into()))?;
                Ok(Outcome::Unit)
            }
            Operation::IsTransactionOpen => Ok(Outcome::Bool(self.transaction.is_some())),
            Operation::Insert { entities } => {
                self.apply(|store| store.insert(entities)).map(Outcome::Keys)
            }
            Operation::Update { entities } => {
                self.apply(|store| store.update(entities)).map(Outcome::Entities)
            }
            Operation::DeleteByKeys { keys } => self
                .apply(|store| Ok(store.delete(|e| keys.contains(&e.key()))))
                .map(Outcome::Count),
            Operation::DeleteByCriteria { criteria } => self
                .apply(|store| Ok(store.delete(|e| criteria.matches(e))))
                .map(Outcome::Count),
            Operation::SelectSingle { criteria } => {
                self.read(|store| store.select_single(&criteria)).map(Outcome::Entity)
            }
            Operation::SelectByKey { key } => self
                .read(|store| {
                    store
                        .rows(&key.entity_id)
                        .find(|e| e.key() == key)
                        .cloned()
                        .ok_or_else(|| BackendError::NotFound(key.to_string()))
                })
                .map(Outcome::Entity),
            Operation::SelectMany { criteria } => self
                .read(|store| Ok(store.select(&criteria)))
                .map(Outcome::Entities),
            Operation::SelectManyByKeys { keys } => self
                .read(|store| {
                    Ok(store
                        .tables
                        .values()
                        .flatten()
                        .filter(|e| keys.contains(&e.key()))
                        .cloned()
                        .collect())
                })
                .map(Outcome::Entities),
            Operation::SelectAll { entity_id } => self
                .read(|store| Ok(store.select(&Criteria::all(entity_id))))
                .map(Outcome::Entities),
            Operation::SelectRowCount { criteria } => self
                .read(|store| Ok(store.select(&criteria).len()))
                .map(Outcome::Count),
            Operation::SelectPropertyValues {
                entity_id,
                property,
                order,
            } => self
                .read(|store| Ok(store.property_values(&entity_id, &property, order)))
                .map(Outcome::Values),
            Operation::SelectDependentEntities { entities } => self
                .read(|store| Ok(store.dependents(&entities)))
                .map(Outcome::Dependents),
            Operation::ExecuteProcedure {
                procedure_id,
                arguments,
            } => {
                let routine = self.db.routine(&procedure_id).ok_or_else(|| {
                    BackendError::Unsupported(format!("unknown procedure '{procedure_id}'"))
                })?;
                routine(arguments.as_slice())?;
                Ok(Outcome::Unit)
            }
            Operation::ExecuteFunction {
                function_id,
                arguments,
            } => {
                let routine = self.db.routine(&function_id).ok_or_else(|| {
                    BackendError::Unsupported(format!("unknown function '{function_id}'"))
                })?;
                routine(arguments.as_slice()).map(Outcome::Values)
            }
            Operation::WriteBlob {
                key,
                property,
                data,
            } => self
                .apply(|store| {
                    if !store.rows(&key.entity_id).any(|e| e.key() == key) {
                        return Err(BackendError::NotFound(key.to_string()));
                    }
                    store.blobs.insert(blob_id(&key, &property), data);
                    Ok(Outcome::Unit)
                }),
            Operation::ReadBlob { key, property } => self.read(|store| {
                store
                    .blobs
                    .get(&blob_id(&key, &property))
                    .cloned()
                    .map(Outcome::Blob)
                    .ok_or_else(|| BackendError::NotFound(format!("{key}#{property}")))
            }),
            Operation::FillReport { report } => self
                .read(|store| Ok(store.report(&report)))
                .map(Outcome::Report),
        }
    }

    async fn is_valid(&mut self) -> bool {
        self.valid()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_transaction_open(&self) -> bool {
        self.transaction.is_some()
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.transaction = None;
            self.db
                .shared
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
            tracing::debug!(user = %self.username, "closed in-memory connection");
        }
    }
}

fn blob_id(key: &EntityKey, property: &str) -> String {
    format!("{key}#{property}")
}

// ── Store operations ────────────────────────────────────────────────

impl Store {
    fn rows<'a>(&'a self, entity_id: &str) -> impl Iterator<Item = &'a Entity> + use<'a> {
        self.tables.get(entity_id).into_iter().flatten()
    }

    fn insert(&mut self, entities: Vec<Entity>) -> BackendResult<Vec<EntityKey>> {
        let mut keys = Vec::with_capacity(entities.len());
        for mut entity in entities {
            if !entity.has_key() {
                entity.fields.insert(
                    0,
                    Field {
                        name: "id".to_string(),
                        value: Value::Int(self.next_id),
                        original: None,
                        primary_key: true,
                    },
                );
                self.next_id += 1;
            }
            entity.mark_saved();
            let key = entity.key();
            if self.rows(&entity.entity_id).any(|e| e.key() == key) {
                return Err(BackendError::Constraint(format!("duplicate key {key}")));
            }
            self.tables
                .entry(entity.entity_id.clone())
                .or_default()
                .push(entity);
            keys.push(key);
        }
        Ok(keys)
    }

    fn update(&mut self, entities: Vec<Entity>) -> BackendResult<Vec<Entity>> {
        let mut updated = Vec::with_capacity(entities.len());
        for entity in entities {
            let key = entity.original_key();
            let table = self.tables.entry(entity.entity_id.clone()).or_default();
            let index = table
                .iter()
                .position(|e| e.key() == key)
                .ok_or_else(|| BackendError::NotFound(key.to_string()))?;

            // Optimistic locking: every modified field must still hold the
            // value the client originally read.
            let stored = &table[index];
            for field in &entity.fields {
                if let Some(original) = &field.original {
                    let current = stored.get(&field.name).unwrap_or(&Value::Null);
                    if current != original {
                        return Err(BackendError::StaleRecord(key.to_string()));
                    }
                }
            }

            let mut saved = entity;
            saved.mark_saved();
            let new_key = saved.key();
            if new_key != key && table.iter().any(|e| e.key() == new_key) {
                return Err(BackendError::Constraint(format!("duplicate key {new_key}")));
            }
            table[index] = saved.clone();
            updated.push(saved);
        }
        Ok(updated)
    }

    fn delete(&mut self, predicate: impl Fn(&Entity) -> bool) -> usize {
        let mut removed = 0;
        for table in self.tables.values_mut() {
            let before = table.len();
            table.retain(|e| !predicate(e));
            removed += before - table.len();
        }
        removed
    }

    fn select(&self, criteria: &Criteria) -> Vec<Entity> {
        self.rows(&criteria.entity_id)
            .filter(|e| criteria.matches(e))
            .cloned()
            .collect()
    }

    fn select_single(&self, criteria: &Criteria) -> BackendResult<Entity> {
        let mut found = self.select(criteria);
        match found.len() {
            0 => Err(BackendError::NotFound(criteria.to_string())),
            1 => Ok(found.remove(0)),
            n => Err(BackendError::Database(format!(
                "{n} records found for single-record query {criteria}"
            ))),
        }
    }

    fn property_values(&self, entity_id: &str, property: &str, order: bool) -> Vec<Value> {
        let mut values: Vec<Value> = Vec::new();
        for entity in self.rows(entity_id) {
            if let Some(value) = entity.get(property) {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        if order {
            values.sort_by_key(|v| v.to_string());
        }
        values
    }

    /// Rows in any table holding a key reference to one of `entities`.
    fn dependents(&self, entities: &[Entity]) -> BTreeMap<String, Vec<Entity>> {
        let keys: Vec<EntityKey> = entities.iter().map(Entity::key).collect();
        let mut result: BTreeMap<String, Vec<Entity>> = BTreeMap::new();
        for (entity_id, rows) in &self.tables {
            for row in rows {
                let references = row
                    .fields
                    .iter()
                    .any(|f| matches!(&f.value, Value::Key(k) if keys.contains(k)));
                if references {
                    result.entry(entity_id.clone()).or_default().push(row.clone());
                }
            }
        }
        result
    }

    /// Plain-text listing of the report's entity type, filtered by the
    /// report parameters as property equality.
    fn report(&self, report: &ReportRequest) -> ReportResult {
        let mut content = String::new();
        for row in self.rows(&report.name) {
            let matches = report
                .parameters
                .iter()
                .all(|(name, value)| row.get(name) == Some(value));
            if matches {
                let fields: Vec<String> = row
                    .fields
                    .iter()
                    .map(|f| format!("{}={}", f.name, f.value))
                    .collect();
                content.push_str(&fields.join("\t"));
                content.push('\n');
            }
        }
        ReportResult {
            name: report.name.clone(),
            content: content.into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scott() -> User {
        User::new("scott", "tiger")
    }

    async fn connect(db: &MemoryDatabase) -> Box<dyn EntityConnection> {
        db.factory().connect(&scott()).await.unwrap()
    }

    fn dept(no: i64, name: &str) -> Entity {
        Entity::new("dept").with_key("deptno", no).with_value("dname", name)
    }

    #[tokio::test]
    async fn insert_and_select() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        let outcome = conn
            .execute(Operation::Insert {
                entities: vec![dept(10, "ACCOUNTING"), dept(20, "RESEARCH")],
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Keys(vec![
                EntityKey::new("dept").with("deptno", 10),
                EntityKey::new("dept").with("deptno", 20)
            ])
        );

        let count = conn
            .execute(Operation::SelectRowCount {
                criteria: Criteria::all("dept"),
            })
            .await
            .unwrap();
        assert_eq!(count, Outcome::Count(2));
    }

    #[tokio::test]
    async fn insert_without_key_assigns_id() {
        let db = MemoryDatabase::new();
        let keys = db.seed(vec![Entity::new("note").with_value("text", "hi")]).unwrap();
        assert_eq!(keys, vec![EntityKey::new("note").with("id", 1)]);
    }

    #[tokio::test]
    async fn duplicate_key_is_constraint_violation() {
        let db = MemoryDatabase::new();
        db.seed(vec![dept(10, "ACCOUNTING")]).unwrap();
        let mut conn = connect(&db).await;
        let err = conn
            .execute(Operation::Insert {
                entities: vec![dept(10, "DUP")],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Constraint(_)));
        assert_eq!(db.row_count("dept"), 1);
    }

    #[tokio::test]
    async fn stale_update_rejected() {
        let db = MemoryDatabase::new();
        db.seed(vec![dept(10, "ACCOUNTING")]).unwrap();
        let mut first = connect(&db).await;
        let mut second = connect(&db).await;

        let mut a = dept(10, "ACCOUNTING");
        a.set("dname", "FINANCE");
        first
            .execute(Operation::Update { entities: vec![a] })
            .await
            .unwrap();

        let mut b = dept(10, "ACCOUNTING");
        b.set("dname", "SALES");
        let err = second
            .execute(Operation::Update { entities: vec![b] })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::StaleRecord(_)));
    }

    #[tokio::test]
    async fn select_single_not_found() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        let err = conn
            .execute(Operation::SelectSingle {
                criteria: Criteria::matching("dept", "deptno", vec![Value::Int(99)]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn rollback_discards_transaction_changes() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        conn.execute(Operation::BeginTransaction).await.unwrap();
        assert!(conn.is_transaction_open());
        conn.execute(Operation::Insert {
            entities: vec![dept(10, "ACCOUNTING")],
        })
        .await
        .unwrap();
        assert_eq!(db.row_count("dept"), 0);

        conn.execute(Operation::RollbackTransaction).await.unwrap();
        assert!(!conn.is_transaction_open());
        assert_eq!(db.row_count("dept"), 0);
    }

    #[tokio::test]
    async fn commit_publishes_transaction_changes() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        conn.execute(Operation::BeginTransaction).await.unwrap();
        conn.execute(Operation::Insert {
            entities: vec![dept(10, "ACCOUNTING")],
        })
        .await
        .unwrap();
        conn.execute(Operation::CommitTransaction).await.unwrap();
        assert_eq!(db.row_count("dept"), 1);
    }

    #[tokio::test]
    async fn commit_without_transaction_fails() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        let err = conn.execute(Operation::CommitTransaction).await.unwrap_err();
        assert!(matches!(err, BackendError::Transaction(_)));
    }

    #[tokio::test]
    async fn dependents_follow_key_references() {
        let db = MemoryDatabase::new();
        let accounting = dept(10, "ACCOUNTING");
        db.seed(vec![
            accounting.clone(),
            Entity::new("emp")
                .with_key("empno", 7)
                .with_value("dept", Value::Key(accounting.key())),
            Entity::new("emp").with_key("empno", 8),
        ])
        .unwrap();
        let mut conn = connect(&db).await;
        let outcome = conn
            .execute(Operation::SelectDependentEntities {
                entities: vec![accounting],
            })
            .await
            .unwrap();
        let Outcome::Dependents(map) = outcome else {
            panic!("expected dependents");
        };
        assert_eq!(map.get("emp").map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn functions_and_blobs() {
        let db = MemoryDatabase::new();
        db.register_routine("double", |args| {
            Ok(args
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Value::Int(i * 2),
                    other => other.clone(),
                })
                .collect())
        });
        db.seed(vec![dept(10, "ACCOUNTING")]).unwrap();
        let mut conn = connect(&db).await;

        let outcome = conn
            .execute(Operation::ExecuteFunction {
                function_id: "double".into(),
                arguments: vec![Value::Int(21)],
            })
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Values(vec![Value::Int(42)]));

        let key = EntityKey::new("dept").with("deptno", 10);
        conn.execute(Operation::WriteBlob {
            key: key.clone(),
            property: "logo".into(),
            data: vec![1, 2, 3],
        })
        .await
        .unwrap();
        let blob = conn
            .execute(Operation::ReadBlob {
                key,
                property: "logo".into(),
            })
            .await
            .unwrap();
        assert_eq!(blob, Outcome::Blob(vec![1, 2, 3]));

        let err = conn
            .execute(Operation::ExecuteProcedure {
                procedure_id: "missing".into(),
                arguments: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(_)));
    }

    #[tokio::test]
    async fn invalidation_and_availability() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        assert!(conn.is_valid().await);

        db.invalidate_connections();
        assert!(!conn.is_valid().await);
        assert!(connect(&db).await.is_valid().await);

        db.set_available(false);
        assert!(db.factory().connect(&scott()).await.is_err());
        assert_eq!(db.connections_opened(), 2);
    }

    #[tokio::test]
    async fn credentials_enforced_when_required() {
        let db = MemoryDatabase::new();
        db.require_credentials(&[scott()]);
        assert!(db.factory().connect(&scott()).await.is_ok());
        assert!(db.factory().connect(&User::new("scott", "wrong")).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes() {
        let db = MemoryDatabase::new();
        let mut conn = connect(&db).await;
        conn.disconnect().await;
        conn.disconnect().await;
        assert!(!conn.is_connected());
        assert_eq!(db.connections_closed(), 1);
        assert!(conn.execute(Operation::IsValid).await.is_err());
    }
}
