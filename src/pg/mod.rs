//! Native PostgreSQL transport.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Async connection state machine
//! - `types`: Value encoding/decoding
//! - `scram`: SCRAM-SHA-256 and MD5 password authentication
//!
//! [`PgDriver`] exposes the async connection through the blocking
//! [`Driver`]/[`Handle`] boundary: every handle owns a current-thread tokio
//! runtime and blocks the caller until the server answers.

pub mod connection;
pub mod protocol;
pub mod scram;
pub mod types;


use tokio::runtime::{Builder, Runtime};

pub use connection::PgConnection;
pub use types::{Oid, Value};

use crate::config::ConnectTarget;
use crate::driver::{Driver, DriverResult, Handle, QueryResult, TransactionStatus};

/// Opens plain TCP connections to a PostgreSQL server.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl Driver for PgDriver {
    type Handle = PgHandle;

    fn connect(&self, target: &ConnectTarget) -> DriverResult<PgHandle> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let conn = runtime.block_on(PgConnection::connect(target))?;
        tracing::debug!(pid = conn.backend_pid(), "PostgreSQL backend started");
        Ok(PgHandle { runtime, conn })
    }
}

/// One blocking PostgreSQL connection.
pub struct PgHandle {
    runtime: Runtime,
    conn: PgConnection,
}

impl PgHandle {
    pub fn backend_pid(&self) -> i32 {
        self.conn.backend_pid()
    }

    /// A parameter the server reported at startup or after a SET.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.conn.parameter(name)
    }
}

impl Handle for PgHandle {
    fn simple_query(&mut self, sql: &str) -> DriverResult<Vec<QueryResult>> {
        self.runtime.block_on(self.conn.simple_query(sql))
    }

    fn query_params(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult> {
        self.runtime.block_on(self.conn.query_params(sql, params))
    }

    fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> DriverResult<()> {
        self.runtime.block_on(self.conn.prepare(name, sql, param_types))
    }

    fn execute_prepared(&mut self, name: &str, params: &[Value]) -> DriverResult<QueryResult> {
        self.runtime.block_on(self.conn.execute(name, params))
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.conn.transaction_status()
    }

    fn escape_identifier(&self, ident: &str) -> Option<String> {
        Some(self.conn.escape_identifier(ident))
    }

    fn escape_literal(&self, literal: &str) -> Option<String> {
        Some(self.conn.escape_literal(literal))
    }

    fn escape_string(&self, value: &str) -> String {
        self.conn.escape_string(value)
    }
}

impl Drop for PgHandle {
    fn drop(&mut self) {
        let pid = self.conn.backend_pid();
        if let Err(e) = self.runtime.block_on(self.conn.close()) {
            tracing::debug!(pid, error = %e, "terminate message not delivered");
        }
    }
}
