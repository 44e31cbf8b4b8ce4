//! In-memory driver and log sink for unit tests.
//!
//! `MockHandle` keeps just enough server state to exercise transaction and
//! savepoint control: status transitions, a savepoint stack with shadowing,
//! failed-transaction semantics and named prepared statements. Parametrized
//! and prepared executions echo their parameters back as a single row; a
//! bind whose value types differ from the prepared types is rejected.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::config::ConnectTarget;
use crate::driver::{Driver, DriverError, DriverResult, Handle, QueryResult, ServerError, TransactionStatus};
use crate::escape;
use crate::log::{Level, LogContext, LogSink};
use crate::pg::types::{Oid, Value};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub connects: usize,
    pub released: usize,
    /// Every statement text sent, in order.
    pub executed: Vec<String>,
    /// (handle id, statement name, parameter types) per prepare call.
    pub prepares: Vec<(usize, String, Vec<Oid>)>,
    pub targets: Vec<String>,
    pub fail_connect: bool,
    /// Statements containing this text fail with a syntax error.
    pub fail_on: Option<String>,
    /// Offer handle-side escaping like libpq does.
    pub rich_escaping: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }
}

impl Driver for MockDriver {
    type Handle = MockHandle;

    fn connect(&self, target: &ConnectTarget) -> DriverResult<MockHandle> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        state.connects += 1;
        state.targets.push(target.to_string());
        Ok(MockHandle {
            id: state.connects,
            state: Arc::clone(&self.state),
            status: TransactionStatus::Idle,
            savepoints: Vec::new(),
            prepared: HashMap::new(),
        })
    }
}

pub(crate) struct MockHandle {
    pub id: usize,
    state: Arc<Mutex<MockState>>,
    status: TransactionStatus,
    savepoints: Vec<String>,
    prepared: HashMap<String, Vec<Oid>>,
}

fn server_error(code: &str, message: &str) -> DriverError {
    DriverError::Server(ServerError::new(code, message))
}

/// `statement` without its leading `prefix`, compared ASCII case-insensitively.
fn strip_keyword<'a>(statement: &'a str, prefix: &str) -> Option<&'a str> {
    statement
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &statement[prefix.len()..])
}

/// Savepoint name as the server sees it.
fn unquote(ident: &str) -> String {
    let ident = ident.trim();
    match ident.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => ident.to_lowercase(),
    }
}

fn tagged(tag: &str) -> QueryResult {
    QueryResult {
        command_tag: tag.to_string(),
        ..QueryResult::default()
    }
}

fn echo(params: &[Value]) -> QueryResult {
    QueryResult {
        rows: vec![params.to_vec()],
        command_tag: "SELECT 1".to_string(),
        ..QueryResult::default()
    }
}

impl MockHandle {
    fn record(&self, sql: &str) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.executed.push(sql.to_string());
        match &state.fail_on {
            Some(needle) if sql.contains(needle.as_str()) => Err(server_error("42601", "syntax error")),
            _ => Ok(()),
        }
    }

    /// Fail the statement, aborting any open transaction.
    fn abort(&mut self, err: DriverError) -> DriverError {
        if self.status != TransactionStatus::Idle {
            self.status = TransactionStatus::InError;
        }
        err
    }

    fn run(&mut self, statement: &str) -> DriverResult<QueryResult> {
        let starts = |keyword: &str| strip_keyword(statement, keyword).is_some();

        if let Some(rest) = strip_keyword(statement, "ROLLBACK TO SAVEPOINT ") {
            let name = unquote(rest);
            return match self.savepoints.iter().rposition(|s| *s == name) {
                Some(pos) => {
                    self.savepoints.truncate(pos + 1);
                    self.status = TransactionStatus::InTransaction;
                    Ok(tagged("ROLLBACK"))
                }
                None => Err(self.abort(server_error("3B001", "savepoint does not exist"))),
            };
        }
        if starts("ROLLBACK") || starts("COMMIT") {
            let tag = if starts("COMMIT") && self.status != TransactionStatus::InError {
                "COMMIT"
            } else {
                "ROLLBACK"
            };
            self.status = TransactionStatus::Idle;
            self.savepoints.clear();
            return Ok(tagged(tag));
        }
        if self.status == TransactionStatus::InError {
            return Err(server_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        if starts("BEGIN") {
            self.status = TransactionStatus::InTransaction;
            return Ok(tagged("BEGIN"));
        }
        if let Some(rest) = strip_keyword(statement, "SAVEPOINT ") {
            if self.status == TransactionStatus::Idle {
                return Err(server_error(
                    "25P01",
                    "SAVEPOINT can only be used in transaction blocks",
                ));
            }
            self.savepoints.push(unquote(rest));
            return Ok(tagged("SAVEPOINT"));
        }
        if let Some(rest) = strip_keyword(statement, "RELEASE SAVEPOINT ") {
            let name = unquote(rest);
            return match self.savepoints.iter().rposition(|s| *s == name) {
                Some(pos) => {
                    self.savepoints.truncate(pos);
                    Ok(tagged("RELEASE"))
                }
                None => Err(self.abort(server_error("3B001", "savepoint does not exist"))),
            };
        }
        if starts("SET") {
            return Ok(tagged("SET"));
        }
        if starts("NOTIFY") {
            return Ok(tagged("NOTIFY"));
        }
        Ok(tagged("SELECT 0"))
    }
}

impl Handle for MockHandle {
    fn simple_query(&mut self, sql: &str) -> DriverResult<Vec<QueryResult>> {
        if let Err(e) = self.record(sql) {
            return Err(self.abort(e));
        }
        sql.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|statement| self.run(statement))
            .collect()
    }

    fn query_params(&mut self, sql: &str, params: &[Value]) -> DriverResult<QueryResult> {
        if let Err(e) = self.record(sql) {
            return Err(self.abort(e));
        }
        Ok(echo(params))
    }

    fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> DriverResult<()> {
        if self.prepared.contains_key(name) {
            return Err(server_error(
                "42P05",
                &format!("prepared statement \"{}\" already exists", name),
            ));
        }
        if let Err(e) = self.record(sql) {
            return Err(self.abort(e));
        }
        self.state
            .lock()
            .prepares
            .push((self.id, name.to_string(), param_types.to_vec()));
        self.prepared.insert(name.to_string(), param_types.to_vec());
        Ok(())
    }

    fn execute_prepared(&mut self, name: &str, params: &[Value]) -> DriverResult<QueryResult> {
        let types = match self.prepared.get(name) {
            Some(types) => types,
            None => {
                return Err(server_error(
                    "26000",
                    &format!("prepared statement \"{}\" does not exist", name),
                ))
            }
        };
        let mismatch = types
            .iter()
            .zip(params)
            .position(|(oid, value)| !value.is_null() && *oid != value.type_oid());
        if let Some(index) = mismatch {
            let err = server_error(
                "22P03",
                &format!("incorrect binary data format in bind parameter {}", index + 1),
            );
            return Err(self.abort(err));
        }
        Ok(echo(params))
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    fn escape_identifier(&self, ident: &str) -> Option<String> {
        self.state
            .lock()
            .rich_escaping
            .then(|| escape::quote_identifier(ident))
    }

    fn escape_literal(&self, literal: &str) -> Option<String> {
        self.state
            .lock()
            .rich_escaping
            .then(|| escape::quote_literal(literal))
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.state.lock().released += 1;
    }
}

/// Log sink that keeps every record.
#[derive(Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<(Level, String, LogContext)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<(Level, String, LogContext)> {
        self.records.lock().clone()
    }

    pub fn levels(&self) -> Vec<Level> {
        self.records.lock().iter().map(|(level, _, _)| *level).collect()
    }
}

impl LogSink for RecordingSink {
    fn log(&self, level: Level, message: &str, context: &LogContext) {
        self.records
            .lock()
            .push((level, message.to_string(), context.clone()));
    }
}
