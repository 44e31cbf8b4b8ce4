//! pgsession: PostgreSQL sessions with a lazily opened connection.
//!
//! A [`Session`] owns one physical connection, opened on first use, and
//! keeps what belongs to that connection next to it:
//!
//! - a prepared statement cache keyed by the exact SQL text,
//! - transaction and savepoint control, with state read from the server,
//! - identifier and literal escaping,
//! - a per-session cache of entity maps and an optional identity mapper.
//!
//! ```no_run
//! use pgsession::{Session, SessionConfig, Value};
//!
//! let config = SessionConfig::new("app", "shop").host("localhost");
//! let mut session = Session::new(config)?;
//!
//! session.begin()?;
//! let result = session.query("SELECT $1::int", &[Value::from(5)])?;
//! assert_eq!(result.get(0, 0), Some(&Value::Int4(5)));
//! session.commit()?;
//! # Ok::<(), pgsession::ConnectionError>(())
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod escape;
pub mod identity;
pub mod log;
pub mod map;
pub mod pg;
pub mod session;
pub mod statement;
mod transaction;

#[cfg(test)]
mod mock;
#[cfg(test)]
mod tests;

pub use config::{ConnectTarget, IdentityMapperSetting, IsolationLevel, SessionConfig};
pub use driver::{Driver, DriverError, Handle, QueryResult, ServerError, TransactionStatus};
pub use error::{ConnectionError, Result, TransactionOp};
pub use identity::{IdentityMapper, IdentityMappers, SmartIdentityMapper};
pub use log::{Level, LogContext, LogSink, TracingSink};
pub use map::{MapContext, MapFactories, MapInstance};
pub use pg::{Oid, PgDriver, PgHandle, Value};
pub use session::{Session, SessionBuilder};
pub use statement::{PreparedQuery, Signature};
