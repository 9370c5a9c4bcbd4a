use std::time::Duration;

use rowgate_core::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool for '{user}' exhausted after {retries} retries ({waited:?})")]
    Exhausted {
        user: String,
        retries: u32,
        waited: Duration,
    },

    #[error("connection pool for '{0}' is disabled")]
    Disabled(String),

    #[error("connection pool for '{0}' is closed")]
    Closed(String),

    #[error("invalid pool settings: {0}")]
    InvalidSettings(String),

    #[error("no connection pool for user '{0}'")]
    NotFound(String),

    #[error("connection pool for '{0}' already exists")]
    Duplicate(String),

    #[error("could not create pooled connection: {0}")]
    Connect(#[from] BackendError),
}

pub type PoolResult<T> = Result<T, PoolError>;
