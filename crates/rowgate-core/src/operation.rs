//! The client operation surface as a single dispatchable enum.
//!
//! Every remote call a client can make against its session is one
//! `Operation` variant; backends answer with an `Outcome`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::summary;
use crate::types::{Criteria, Entity, EntityKey, ReportRequest, ReportResult, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    IsValid,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    IsTransactionOpen,
    Insert {
        entities: Vec<Entity>,
    },
    Update {
        entities: Vec<Entity>,
    },
    DeleteByKeys {
        keys: Vec<EntityKey>,
    },
    DeleteByCriteria {
        criteria: Criteria,
    },
    SelectSingle {
        criteria: Criteria,
    },
    SelectByKey {
        key: EntityKey,
    },
    SelectMany {
        criteria: Criteria,
    },
    SelectManyByKeys {
        keys: Vec<EntityKey>,
    },
    SelectAll {
        entity_id: String,
    },
    SelectRowCount {
        criteria: Criteria,
    },
    SelectPropertyValues {
        entity_id: String,
        property: String,
        #[serde(default)]
        order: bool,
    },
    SelectDependentEntities {
        entities: Vec<Entity>,
    },
    ExecuteProcedure {
        procedure_id: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    ExecuteFunction {
        function_id: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    WriteBlob {
        key: EntityKey,
        property: String,
        data: Vec<u8>,
    },
    ReadBlob {
        key: EntityKey,
        property: String,
    },
    FillReport {
        report: ReportRequest,
    },
}

impl Operation {
    /// Method name recorded in traces.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::IsValid => "isValid",
            Operation::BeginTransaction => "beginTransaction",
            Operation::CommitTransaction => "commitTransaction",
            Operation::RollbackTransaction => "rollbackTransaction",
            Operation::IsTransactionOpen => "isTransactionOpen",
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::DeleteByKeys { .. } => "deleteByKeys",
            Operation::DeleteByCriteria { .. } => "deleteByCriteria",
            Operation::SelectSingle { .. } => "selectSingle",
            Operation::SelectByKey { .. } => "selectByKey",
            Operation::SelectMany { .. } => "selectMany",
            Operation::SelectManyByKeys { .. } => "selectManyByKeys",
            Operation::SelectAll { .. } => "selectAll",
            Operation::SelectRowCount { .. } => "selectRowCount",
            Operation::SelectPropertyValues { .. } => "selectPropertyValues",
            Operation::SelectDependentEntities { .. } => "selectDependentEntities",
            Operation::ExecuteProcedure { .. } => "executeProcedure",
            Operation::ExecuteFunction { .. } => "executeFunction",
            Operation::WriteBlob { .. } => "writeBlob",
            Operation::ReadBlob { .. } => "readBlob",
            Operation::FillReport { .. } => "fillReport",
        }
    }

    /// Whether completed calls are appended to the session's call log.
    /// Validity polling is excluded.
    pub fn is_logged(&self) -> bool {
        !matches!(self, Operation::IsValid)
    }

    /// Argument summary recorded in traces.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = match self {
            Operation::IsValid
            | Operation::BeginTransaction
            | Operation::CommitTransaction
            | Operation::RollbackTransaction
            | Operation::IsTransactionOpen => Vec::new(),
            Operation::Insert { entities }
            | Operation::Update { entities }
            | Operation::SelectDependentEntities { entities } => vec![summary::list(entities)],
            Operation::DeleteByKeys { keys } | Operation::SelectManyByKeys { keys } => {
                vec![summary::list(keys)]
            }
            Operation::DeleteByCriteria { criteria }
            | Operation::SelectSingle { criteria }
            | Operation::SelectMany { criteria }
            | Operation::SelectRowCount { criteria } => vec![criteria.to_string()],
            Operation::SelectByKey { key } => vec![key.to_string()],
            Operation::SelectAll { entity_id } => vec![entity_id.clone()],
            Operation::SelectPropertyValues {
                entity_id,
                property,
                order,
            } => vec![entity_id.clone(), property.clone(), order.to_string()],
            Operation::ExecuteProcedure {
                procedure_id: id,
                arguments,
            }
            | Operation::ExecuteFunction {
                function_id: id,
                arguments,
            } => vec![id.clone(), summary::list(arguments)],
            Operation::WriteBlob {
                key,
                property,
                data,
            } => vec![
                key.to_string(),
                property.clone(),
                format!("<{} bytes>", data.len()),
            ],
            Operation::ReadBlob { key, property } => vec![key.to_string(), property.clone()],
            Operation::FillReport { report } => vec![report.to_string()],
        };
        summary::arguments(&parts)
    }
}

/// The result of executing an `Operation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Unit,
    Bool(bool),
    Count(usize),
    Keys(Vec<EntityKey>),
    Entity(Entity),
    Entities(Vec<Entity>),
    Values(Vec<Value>),
    Dependents(BTreeMap<String, Vec<Entity>>),
    Blob(Vec<u8>),
    Report(ReportResult),
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Unit => "unit",
            Outcome::Bool(_) => "bool",
            Outcome::Count(_) => "count",
            Outcome::Keys(_) => "keys",
            Outcome::Entity(_) => "entity",
            Outcome::Entities(_) => "entities",
            Outcome::Values(_) => "values",
            Outcome::Dependents(_) => "dependents",
            Outcome::Blob(_) => "blob",
            Outcome::Report(_) => "report",
        }
    }
}
