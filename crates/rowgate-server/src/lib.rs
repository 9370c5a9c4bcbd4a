//! rowgate-server: remote connection server.
//!
//! # Architecture
//!
//! ```text
//! EntityServer
//!   ├── SessionRegistry ── Session ── CallInterceptor ── ConnectionBroker
//!   │                                      │                 ├── ConnectionPools (per user)
//!   │                                      │                 └── dedicated connections
//!   │                                      └── RequestRateCounter
//!   ├── MaintenanceScheduler (reaps idle / broken sessions)
//!   └── ServerAdmin (privileged view and tuning)
//! ```
//!
//! Every client operation goes through [`Session::invoke`], which hands it
//! to the interceptor: acquire a connection, trace and time the call,
//! release or pin the connection.

pub mod admin;
pub mod broker;
pub mod error;
pub mod interceptor;
pub mod log_level;
pub mod maintenance;
pub mod rate;
pub mod registry;
pub mod server;
pub mod session;

pub use admin::{ClientInfo, ServerAdmin, ServerInfo};
pub use broker::{BackendConnection, ConnectionBroker};
pub use error::{ServerError, ServerResult};
pub use interceptor::{ActiveCalls, CallInterceptor};
pub use log_level::LogLevelHandle;
pub use maintenance::MaintenanceScheduler;
pub use rate::RequestRateCounter;
pub use registry::SessionRegistry;
pub use server::EntityServer;
pub use session::{ReapReason, Session, SessionState};
