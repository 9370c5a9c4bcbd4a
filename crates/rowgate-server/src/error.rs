use rowgate_core::BackendError;
use rowgate_pool::PoolError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("backend connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// A backend failure, envelope layers already removed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("client not found: {0}")]
    ClientNotFound(Uuid),

    #[error("authentication failed for user '{0}'")]
    Authentication(String),

    #[error("connection limit of {0} reached")]
    ConnectionLimitReached(usize),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("no connection pool for user '{0}'")]
    PoolNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("transaction closed unexpectedly for {0}")]
    TransactionClosed(String),

    #[error("session {0} is disconnected")]
    NotConnected(Uuid),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{operation} returned an unexpected {got} outcome")]
    UnexpectedOutcome { operation: String, got: String },
}

impl ServerError {
    /// Stable machine-readable kind. Backend errors report their own kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::PoolExhausted(_) => "pool_exhausted",
            ServerError::ConnectionUnavailable(_) => "connection_unavailable",
            ServerError::Backend(e) => e.kind(),
            ServerError::ClientNotFound(_) => "client_not_found",
            ServerError::Authentication(_) => "authentication",
            ServerError::ConnectionLimitReached(_) => "connection_limit_reached",
            ServerError::ShuttingDown => "shutting_down",
            ServerError::PoolNotFound(_) => "pool_not_found",
            ServerError::InvalidConfiguration(_) => "invalid_configuration",
            ServerError::TransactionClosed(_) => "transaction_closed",
            ServerError::NotConnected(_) => "not_connected",
            ServerError::Unsupported(_) => "unsupported",
            ServerError::UnexpectedOutcome { .. } => "unexpected_outcome",
        }
    }
}

impl From<PoolError> for ServerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => ServerError::PoolExhausted(err.to_string()),
            PoolError::Disabled(_) | PoolError::Closed(_) | PoolError::Connect(_) => {
                ServerError::ConnectionUnavailable(err.to_string())
            }
            PoolError::InvalidSettings(msg) => ServerError::InvalidConfiguration(msg),
            PoolError::Duplicate(_) => ServerError::InvalidConfiguration(err.to_string()),
            PoolError::NotFound(user) => ServerError::PoolNotFound(user),
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
