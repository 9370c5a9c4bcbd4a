//! Human-readable argument summaries for call traces.
//!
//! Lists render as `[a, b]`, entities as `emp {id: 7, name: KING->QUEEN}`
//! (primary-key and modified fields only), keys as `emp {id: 7}` and
//! criteria as `emp, dept, [10, 20]`.

use std::fmt;

use crate::types::{Criteria, Entity, EntityKey, ReportRequest, Value};

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::List(values) => write!(f, "{}", list(values)),
            Value::Entity(entity) => write!(f, "{entity}"),
            Value::Key(key) => write!(f, "{key}"),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<String> = self
            .fields
            .iter()
            .filter(|field| field.primary_key || field.original.is_some())
            .map(|field| match &field.original {
                Some(original) => format!("{}: {}->{}", field.name, original, field.value),
                None => format!("{}: {}", field.name, field.value),
            })
            .collect();
        write!(f, "{} {{{}}}", self.entity_id, fields.join(", "))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self
            .values
            .iter()
            .map(|(property, value)| format!("{property}: {value}"))
            .collect();
        write!(f, "{} {{{}}}", self.entity_id, values.join(", "))
    }
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.property {
            Some(property) => write!(f, "{}, {}, {}", self.entity_id, property, list(&self.values)),
            None => f.write_str(&self.entity_id),
        }
    }
}

impl fmt::Display for ReportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect();
        write!(f, "{} {{{}}}", self.name, parameters.join(", "))
    }
}

/// Render a slice as `[a, b, c]`.
pub fn list<T: fmt::Display>(items: &[T]) -> String {
    let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

/// Join already-rendered top-level arguments.
pub fn arguments(parts: &[String]) -> String {
    parts.join(", ")
}
