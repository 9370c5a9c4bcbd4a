//! Credentials, client identities and the value model passed to backends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Credentials ─────────────────────────────────────────────────────

/// A username/password credential.
///
/// The password is accepted on input but never serialized back out and
/// never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `username:password`. A missing password is treated as empty.
    pub fn parse(credentials: &str) -> Option<Self> {
        let (username, password) = credentials.split_once(':').unwrap_or((credentials, ""));
        if username.is_empty() {
            return None;
        }
        Some(Self::new(username, password))
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

// ── Client identity ─────────────────────────────────────────────────

/// Immutable identity of a connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientIdentity {
    pub client_id: Uuid,
    pub user: User,
    pub client_type: String,
    pub client_host: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u64,
}

impl ClientIdentity {
    /// `username@clientType`, used as the tracing span label for a session.
    pub fn log_identifier(&self) -> String {
        format!("{}@{}", self.user.username, self.client_type)
    }
}

/// A client's request to open (or re-attach to) a session.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionRequest {
    pub user: User,
    pub client_type: String,
    #[serde(default)]
    pub client_id: Option<Uuid>,
    #[serde(default)]
    pub client_host: Option<String>,
}

impl ConnectionRequest {
    pub fn new(user: User, client_type: impl Into<String>) -> Self {
        Self {
            user,
            client_type: client_type.into(),
            client_id: None,
            client_host: None,
        }
    }

    pub fn with_client_id(mut self, client_id: Uuid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.client_host = Some(host.into());
        self
    }
}

// ── Value model ─────────────────────────────────────────────────────

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Entity(Entity),
    Key(EntityKey),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

/// One named property of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
    /// Value before the first unsaved modification. Present iff modified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<Value>,
    #[serde(default)]
    pub primary_key: bool,
}

/// An entity instance: an entity type id plus ordered fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Entity {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            fields: Vec::new(),
        }
    }

    /// Builder: add a primary-key field.
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            original: None,
            primary_key: true,
        });
        self
    }

    /// Builder: add a plain field.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            original: None,
            primary_key: false,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Set a field value, remembering the first original value.
    ///
    /// Setting a value back to its original clears the modification.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => {
                if field.value == value {
                    return;
                }
                let previous = std::mem::replace(&mut field.value, value);
                match &field.original {
                    Some(original) if *original == field.value => field.original = None,
                    Some(_) => {}
                    None => field.original = Some(previous),
                }
            }
            None => self.fields.push(Field {
                name: name.to_string(),
                value,
                original: Some(Value::Null),
                primary_key: false,
            }),
        }
    }

    pub fn is_modified(&self) -> bool {
        self.fields.iter().any(|f| f.original.is_some())
    }

    /// Drop modification state, as after a successful save.
    pub fn mark_saved(&mut self) {
        for field in &mut self.fields {
            field.original = None;
        }
    }

    pub fn has_key(&self) -> bool {
        self.fields.iter().any(|f| f.primary_key)
    }

    /// The primary key built from the key fields' original values.
    ///
    /// Using originals means a modified key still identifies the stored row.
    pub fn original_key(&self) -> EntityKey {
        EntityKey {
            entity_id: self.entity_id.clone(),
            values: self
                .fields
                .iter()
                .filter(|f| f.primary_key)
                .map(|f| {
                    let value = f.original.as_ref().unwrap_or(&f.value);
                    (f.name.clone(), value.clone())
                })
                .collect(),
        }
    }

    /// The primary key built from the key fields' current values.
    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_id: self.entity_id.clone(),
            values: self
                .fields
                .iter()
                .filter(|f| f.primary_key)
                .map(|f| (f.name.clone(), f.value.clone()))
                .collect(),
        }
    }
}

/// A primary key: entity type id plus ordered key property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub values: Vec<(String, Value)>,
}

impl EntityKey {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            values: Vec::new(),
        }
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((property.into(), value.into()));
        self
    }
}

/// A serializable selector: all rows of an entity type, optionally
/// restricted to rows whose `property` equals one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    pub entity_id: String,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Criteria {
    pub fn all(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            property: None,
            values: Vec::new(),
        }
    }

    pub fn matching(
        entity_id: impl Into<String>,
        property: impl Into<String>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            property: Some(property.into()),
            values,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.entity_id != self.entity_id {
            return false;
        }
        match &self.property {
            None => true,
            Some(property) => match entity.get(property) {
                Some(value) => self.values.iter().any(|v| v == value),
                None => self.values.iter().any(|v| *v == Value::Null),
            },
        }
    }
}

/// A report to fill: report name plus named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// A filled report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResult {
    pub name: String,
    pub content: Vec<u8>,
}
