//! Error types for the session layer.
//!
//! Every failure a caller can see is a [`ConnectionError`]. Variants that wrap
//! a transport failure keep it as their `source()` and carry the SQL that was
//! being run.

use std::fmt;

use thiserror::Error;

use crate::config::IsolationLevel;
use crate::driver::DriverError;

/// Transaction-control statement that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOp {
    Begin,
    Commit,
    Rollback,
    RollbackTo(String),
    SetSavepoint(String),
    ReleaseSavepoint(String),
}

impl TransactionOp {
    /// Savepoint involved, if any.
    pub fn savepoint(&self) -> Option<&str> {
        match self {
            TransactionOp::RollbackTo(name)
            | TransactionOp::SetSavepoint(name)
            | TransactionOp::ReleaseSavepoint(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionOp::Begin => f.write_str("begin transaction"),
            TransactionOp::Commit => f.write_str("commit transaction"),
            TransactionOp::Rollback => f.write_str("rollback transaction"),
            TransactionOp::RollbackTo(name) => write!(f, "rollback to savepoint '{}'", name),
            TransactionOp::SetSavepoint(name) => write!(f, "set savepoint '{}'", name),
            TransactionOp::ReleaseSavepoint(name) => write!(f, "release savepoint '{}'", name),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The handle could not be opened. `dsn` never contains the password.
    #[error("Error connecting to the database with dsn '{dsn}'")]
    Establishment {
        dsn: String,
        #[source]
        source: DriverError,
    },

    #[error("Error while applying settings '{sql}'")]
    SessionConfiguration {
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("Cannot {operation} (isolation level '{isolation}')")]
    TransactionControl {
        operation: TransactionOp,
        isolation: IsolationLevel,
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("Query execution failed: {sql}")]
    QueryExecution {
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("Could not notify '{channel}' event")]
    Notification {
        channel: String,
        sql: String,
        #[source]
        source: DriverError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No map registered for entity '{0}'")]
    UnknownEntity(String),

    #[error("Map for entity '{entity}' is not a {expected}")]
    MapTypeMismatch {
        entity: String,
        expected: &'static str,
    },
}

impl ConnectionError {
    /// SQL that was being run when the error occurred.
    pub fn sql(&self) -> Option<&str> {
        match self {
            ConnectionError::SessionConfiguration { sql, .. }
            | ConnectionError::TransactionControl { sql, .. }
            | ConnectionError::QueryExecution { sql, .. }
            | ConnectionError::Notification { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Underlying transport failure, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            ConnectionError::Establishment { source, .. }
            | ConnectionError::SessionConfiguration { source, .. }
            | ConnectionError::TransactionControl { source, .. }
            | ConnectionError::QueryExecution { source, .. }
            | ConnectionError::Notification { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
