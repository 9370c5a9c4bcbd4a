//! Backend error types.

use thiserror::Error;

/// Errors reported by a backend connection.
///
/// The kinds mirror what a database driver surfaces to an application:
/// constraint violations, optimistic-locking conflicts, missing rows and
/// generic driver failures. `Envelope` is added by remote call layers that
/// wrap an underlying failure; callers strip it with [`BackendError::unwrap_envelope`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("record modified by another user: {0}")]
    StaleRecord(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("remote invocation failed: {0}")]
    Envelope(Box<BackendError>),
}

impl BackendError {
    /// Wrap an error in a transport envelope.
    pub fn envelope(inner: BackendError) -> Self {
        BackendError::Envelope(Box::new(inner))
    }

    /// Strip every transport envelope layer, returning the original failure.
    pub fn unwrap_envelope(self) -> Self {
        let mut error = self;
        while let BackendError::Envelope(inner) = error {
            error = *inner;
        }
        error
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Constraint(_) => "constraint",
            BackendError::StaleRecord(_) => "stale_record",
            BackendError::NotFound(_) => "not_found",
            BackendError::Database(_) => "database",
            BackendError::Connection(_) => "connection",
            BackendError::Transaction(_) => "transaction",
            BackendError::Unsupported(_) => "unsupported",
            BackendError::Envelope(_) => "envelope",
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
