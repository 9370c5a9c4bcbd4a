//! Backend connection traits.
//!
//! The server never talks to a database directly: it holds boxed
//! `EntityConnection`s produced by a `ConnectionFactory`.

use std::fmt;

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::operation::{Operation, Outcome};
use crate::types::User;

/// An open backend connection for one user.
#[async_trait]
pub trait EntityConnection: Send + fmt::Debug {
    /// Execute one operation.
    async fn execute(&mut self, operation: Operation) -> BackendResult<Outcome>;

    /// Round-trip check that the connection is still usable.
    async fn is_valid(&mut self) -> bool;

    /// Whether `disconnect` has not yet been called.
    fn is_connected(&self) -> bool;

    fn is_transaction_open(&self) -> bool;

    /// Close the underlying connection. Idempotent.
    async fn disconnect(&mut self);
}

/// Creates backend connections for a user.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, user: &User) -> BackendResult<Box<dyn EntityConnection>>;
}
