//! rowgate-core: shared types for the rowgate connection server.
//!
//! Everything the server tiers agree on lives here: credentials and client
//! identities, the serializable value model passed through to backends, the
//! `Operation`/`Outcome` dispatch pair, the `EntityConnection` backend trait,
//! call traces and the TOML configuration.
//!
//! # Architecture
//!
//! ```text
//! ConnectionFactory ──connect(user)──▶ Box<dyn EntityConnection>
//!                                         └── execute(Operation) → Outcome
//!
//! CallTrace (one per intercepted operation)
//!   └── children (connection acquisition, nested calls)
//! CallLog (per-session ring buffer of completed traces)
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod memory;
pub mod operation;
pub mod summary;
pub mod trace;
pub mod types;

pub use config::{PoolConfig, ServerConfig};
pub use connection::{ConnectionFactory, EntityConnection};
pub use error::{BackendError, BackendResult};
pub use operation::{Operation, Outcome};
pub use trace::{CallLog, CallTrace, ClientLog, TraceError};
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
