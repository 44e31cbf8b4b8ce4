//! Boundary between a [`Session`](crate::Session) and the native transport.
//!
//! A [`Driver`] opens physical connections; a [`Handle`] is one live
//! connection. The session never talks to the network itself: establishing a
//! connection, running text or parametrized SQL, preparing statements and
//! reporting the server's transaction status are all primitive calls on these
//! traits. Failures come back as [`DriverError`] and are converted into
//! [`ConnectionError`](crate::ConnectionError) by the session.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConnectTarget;
use crate::pg::protocol::FieldDescription;
use crate::pg::types::{Oid, Value};

/// Result type for transport primitives.
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by a transport primitive.
#[derive(Error, Debug)]
pub enum DriverError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected message or malformed frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server rejected the request.
    #[error("{0}")]
    Server(ServerError),

    /// Value could not be encoded or decoded.
    #[error("Type error: {0}")]
    Type(String),

    /// The connection is closed or unusable.
    #[error("Connection is closed")]
    Closed,
}

/// Error reported by the server in an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE code, e.g. `3B001` for an unknown savepoint.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

// ============================================================================
// Transaction status
// ============================================================================

/// Transaction status as reported by the server.
///
/// The numeric codes match libpq's `PQtransactionStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Not inside a transaction block.
    Idle,
    /// A command is in progress.
    Active,
    /// Inside a valid transaction block.
    InTransaction,
    /// Inside a failed transaction block; only ROLLBACK is accepted.
    InError,
    /// The connection is bad or the status has never been reported.
    Unknown,
}

impl TransactionStatus {
    /// Map a ReadyForQuery indicator byte (`I`, `T`, `E`).
    pub fn from_indicator(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        }
    }

    /// libpq numeric code.
    pub fn code(self) -> u8 {
        match self {
            TransactionStatus::Idle => 0,
            TransactionStatus::Active => 1,
            TransactionStatus::InTransaction => 2,
            TransactionStatus::InError => 3,
            TransactionStatus::Unknown => 4,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Idle => "idle",
            TransactionStatus::Active => "active",
            TransactionStatus::InTransaction => "in transaction",
            TransactionStatus::InError => "in failed transaction",
            TransactionStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one executed statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column descriptions, shared with the statement that produced them.
    pub columns: Arc<Vec<FieldDescription>>,
    pub rows: Vec<Vec<Value>>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value at `row`, `column`, if present.
    pub fn get(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Number of rows touched, read from the trailing number of the command tag.
    pub fn affected_rows(&self) -> Option<u64> {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Factory for physical connections.
pub trait Driver {
    type Handle: Handle;

    /// Open a new physical connection.
    ///
    /// Implementations must never hand back a pooled or shared connection:
    /// each call yields a handle exclusively owned by the caller.
    fn connect(&self, target: &ConnectTarget) -> DriverResult<Self::Handle>;
}

/// A live connection. Dropping it releases the connection.
pub trait Handle {
    /// Run unparametrized SQL, possibly several `;`-separated statements.
    fn simple_query(&mut self, sql: &str) -> DriverResult<Vec<QueryResult>>;

    /// Run one statement with positional parameters, without naming it.
    fn query_params(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult>;

    /// Create a named server-side prepared statement.
    fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> DriverResult<()>;

    /// Execute a statement previously created with [`Handle::prepare`].
    fn execute_prepared(&mut self, name: &str, params: &[Value]) -> DriverResult<QueryResult>;

    /// Server-reported transaction status of this connection.
    fn transaction_status(&self) -> TransactionStatus;

    /// Connection-aware identifier quoting, when the transport offers one.
    fn escape_identifier(&self, _ident: &str) -> Option<String> {
        None
    }

    /// Connection-aware literal quoting, when the transport offers one.
    fn escape_literal(&self, _literal: &str) -> Option<String> {
        None
    }

    /// Escape the contents of a string literal, without the surrounding quotes.
    fn escape_string(&self, value: &str) -> String {
        value.replace('\'', "''")
    }
}
