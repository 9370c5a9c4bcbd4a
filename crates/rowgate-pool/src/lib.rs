//! rowgate-pool: bounded per-user pools of backend connections.
//!
//! Pools are keyed by database username. A checkout beyond `maximum_size`
//! blocks (retrying in short steps) until a connection is returned or the
//! checkout timeout elapses. Each pool registered in `ConnectionPools` gets
//! a background cleanup task that retires idle connections and keeps the
//! pool at its minimum size.

pub mod error;
pub mod pool;
pub mod registry;
pub mod settings;
pub mod statistics;

pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionPool, Maintenance, PooledConnection};
pub use registry::ConnectionPools;
pub use settings::PoolSettings;
pub use statistics::{PoolSample, PoolStatistics};
