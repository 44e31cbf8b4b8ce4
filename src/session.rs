//! The session: one lazily opened connection plus everything scoped to it.
//!
//! A [`Session`] owns at most one driver handle at a time, its prepared
//! statement cache, its entity maps and its savepoint bookkeeping. Nothing
//! in it is shared with other sessions except the identity mapper, which is
//! only referenced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::driver::{Driver, DriverError, Handle, QueryResult};
use crate::error::{ConnectionError, Result};
use crate::identity::{IdentityMapper, IdentityMappers};
use crate::log::{Level, LogContext, LogSink, SESSION_KEY};
use crate::map::{MapFactories, MapRegistry};
use crate::pg::types::{Oid, Value};
use crate::pg::PgDriver;
use crate::statement::{PreparedQuery, Signature, StatementCache};

/// A handle together with the statements already prepared on it.
pub(crate) struct Live<H> {
    pub(crate) handle: H,
    /// Statement name to the parameter types of each server-side variant.
    /// Variant `k` is prepared as `name` for `k == 0`, `name_k` otherwise.
    prepared: HashMap<String, Vec<Vec<Oid>>>,
}

/// Whether a statement prepared with `types` can bind `values` as they
/// encode. NULL binds to any type.
fn accepts(types: &[Oid], values: &[Value]) -> bool {
    types.len() == values.len()
        && types
            .iter()
            .zip(values)
            .all(|(oid, value)| value.is_null() || *oid == value.type_oid())
}

fn variant_name(name: &str, index: usize) -> String {
    match index {
        0 => name.to_string(),
        k => format!("{}_{}", name, k),
    }
}

pub struct Session<D: Driver = PgDriver> {
    pub(crate) id: Uuid,
    driver: D,
    pub(crate) config: SessionConfig,
    live: Option<Live<D::Handle>>,
    statements: StatementCache,
    pub(crate) maps: MapRegistry,
    pub(crate) identity_mapper: Option<Arc<dyn IdentityMapper>>,
    logger: Option<Arc<dyn LogSink>>,
    pub(crate) savepoints: Vec<String>,
}

// ============================================================================
// Construction
// ============================================================================

pub struct SessionBuilder<D: Driver = PgDriver> {
    config: SessionConfig,
    driver: D,
    logger: Option<Arc<dyn LogSink>>,
    identity_mapper: Option<Arc<dyn IdentityMapper>>,
    identity_mappers: IdentityMappers,
    maps: MapFactories,
}

impl<D: Driver> SessionBuilder<D> {
    /// Use another transport.
    pub fn driver<E: Driver>(self, driver: E) -> SessionBuilder<E> {
        SessionBuilder {
            config: self.config,
            driver,
            logger: self.logger,
            identity_mapper: self.identity_mapper,
            identity_mappers: self.identity_mappers,
            maps: self.maps,
        }
    }

    pub fn logger(mut self, logger: Arc<dyn LogSink>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Inject an identity mapper. Takes precedence over the configuration.
    pub fn identity_mapper(mut self, mapper: Arc<dyn IdentityMapper>) -> Self {
        self.identity_mapper = Some(mapper);
        self
    }

    /// Registry used to resolve a named `identity_mapper` setting.
    pub fn identity_mappers(mut self, mappers: IdentityMappers) -> Self {
        self.identity_mappers = mappers;
        self
    }

    pub fn maps(mut self, maps: MapFactories) -> Self {
        self.maps = maps;
        self
    }

    /// Validate the configuration and create the session. No connection is
    /// opened here.
    pub fn build(self) -> Result<Session<D>> {
        self.config.validate()?;
        let identity_mapper = match self.identity_mapper {
            Some(mapper) => Some(mapper),
            None => self
                .identity_mappers
                .resolve(self.config.identity_mapper_setting())?,
        };

        Ok(Session {
            id: Uuid::new_v4(),
            driver: self.driver,
            config: self.config,
            live: None,
            statements: StatementCache::new(),
            maps: MapRegistry::new(self.maps),
            identity_mapper,
            logger: self.logger,
            savepoints: Vec::new(),
        })
    }
}

impl Session<PgDriver> {
    pub fn builder(config: SessionConfig) -> SessionBuilder<PgDriver> {
        SessionBuilder {
            config,
            driver: PgDriver,
            logger: None,
            identity_mapper: None,
            identity_mappers: IdentityMappers::new(),
            maps: MapFactories::new(),
        }
    }

    /// A session on the native PostgreSQL driver with default collaborators.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::builder(config).build()
    }
}

// ============================================================================
// Handle lifecycle
// ============================================================================

impl<D: Driver> Session<D> {
    /// The live handle, opened on first use.
    pub fn handle(&mut self) -> Result<&mut D::Handle> {
        Ok(&mut self.live()?.handle)
    }

    /// Release the current handle, if any, and open a new one.
    ///
    /// Statements stay cached and are prepared again on the new handle when
    /// next executed.
    pub fn reconnect(&mut self) -> Result<&mut D::Handle> {
        self.release();
        self.handle()
    }

    pub fn is_connected(&self) -> bool {
        self.live.is_some()
    }

    fn live(&mut self) -> Result<&mut Live<D::Handle>> {
        let live = match self.live.take() {
            Some(live) => live,
            None => self.launch()?,
        };
        Ok(self.live.insert(live))
    }

    fn launch(&self) -> Result<Live<D::Handle>> {
        let target = self.config.target();
        let mut handle = match self.driver.connect(&target) {
            Ok(handle) => handle,
            Err(source) => {
                return Err(self.fail(
                    Level::Alert,
                    ConnectionError::Establishment {
                        dsn: target.to_string(),
                        source,
                    },
                ))
            }
        };

        if let Some(sql) = self.config.settings_sql() {
            if let Err(source) = handle.simple_query(&sql) {
                return Err(self.fail(Level::Critical, ConnectionError::SessionConfiguration { sql, source }));
            }
        }

        tracing::debug!(session = %self.id, %target, "handle established");
        Ok(Live {
            handle,
            prepared: HashMap::new(),
        })
    }

    fn release(&mut self) {
        if let Some(live) = self.live.take() {
            tracing::debug!(session = %self.id, statements = live.prepared.len(), "releasing handle");
            drop(live);
        }
        self.savepoints.clear();
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Queries
// ============================================================================

impl<D: Driver> Session<D> {
    /// Run SQL text without parameters. Several statements may be sent at
    /// once; the result of the last one is returned.
    ///
    /// Execution failures come back as [`ConnectionError::QueryExecution`]
    /// and are not logged; the caller decides whether they are fatal.
    pub fn execute_anonymous_query(&mut self, sql: &str) -> Result<QueryResult> {
        self.log(Level::Notice, &format!("Anonymous query « {} ».", sql), LogContext::new());
        self.handle()?
            .simple_query(sql)
            .map(|mut results| results.pop().unwrap_or_default())
            .map_err(|source| query_execution(sql, source))
    }

    /// Run SQL with positional parameters (`$1`, `$2`, ...) without caching
    /// a statement. Same failure contract as
    /// [`execute_anonymous_query`](Self::execute_anonymous_query).
    pub fn execute_parametrized_query(&mut self, sql: &str, values: &[Value]) -> Result<QueryResult> {
        self.log(
            Level::Notice,
            &format!("Parametrized anonymous query « {} ».", sql),
            LogContext::new(),
        );
        self.handle()?
            .query_params(sql, values)
            .map_err(|source| query_execution(sql, source))
    }

    /// Execute `sql` through the statement cache.
    pub fn query(&mut self, sql: &str, values: &[Value]) -> Result<QueryResult> {
        let query = self.get_query(sql);
        query.execute(self, values)
    }

    /// The cached statement for `sql`, created on a miss. Never touches the
    /// server.
    pub fn get_query(&mut self, sql: &str) -> Arc<PreparedQuery> {
        self.statements.get_or_create(sql)
    }

    pub fn has_query(&self, signature: &Signature) -> bool {
        self.statements.contains(signature)
    }

    /// A statement with a fresh name that bypasses the cache.
    pub fn create_prepared_query(&mut self, sql: &str) -> PreparedQuery {
        self.statements.create(sql)
    }

    pub(crate) fn execute_prepared(&mut self, query: &PreparedQuery, values: &[Value]) -> Result<QueryResult> {
        let live = self.live()?;
        let variants = live.prepared.entry(query.name().to_string()).or_default();
        let server_name = match variants.iter().position(|types| accepts(types, values)) {
            Some(index) => variant_name(query.name(), index),
            None => {
                let types: Vec<Oid> = values.iter().map(Value::type_oid).collect();
                let server_name = variant_name(query.name(), variants.len());
                if let Err(source) = live.handle.prepare(&server_name, query.sql(), &types) {
                    return Err(self.fail(Level::Error, query_execution(query.sql(), source)));
                }
                variants.push(types);
                tracing::debug!(session = %self.id, statement = %server_name, "statement prepared");
                server_name
            }
        };

        let live = self.live()?;
        match live.handle.execute_prepared(&server_name, values) {
            Ok(result) => Ok(result),
            Err(source) => Err(self.fail(Level::Error, query_execution(query.sql(), source))),
        }
    }

    /// Send `NOTIFY channel[, payload]`. An empty payload is sent as none.
    pub fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<()> {
        let mut sql = format!("NOTIFY {}", self.escape_identifier(channel)?);
        if let Some(payload) = payload.filter(|p| !p.is_empty()) {
            sql.push_str(", ");
            sql.push_str(&self.escape_literal(payload)?);
        }

        match self.execute_anonymous_query(&sql) {
            Ok(_) => Ok(()),
            Err(ConnectionError::QueryExecution { sql, source }) => Err(self.fail(
                Level::Error,
                ConnectionError::Notification {
                    channel: channel.to_string(),
                    sql,
                    source,
                },
            )),
            Err(other) => Err(other),
        }
    }
}

fn query_execution(sql: &str, source: DriverError) -> ConnectionError {
    ConnectionError::QueryExecution {
        sql: sql.to_string(),
        source,
    }
}

// ============================================================================
// Logging and accessors
// ============================================================================

impl<D: Driver> Session<D> {
    /// Forward to the log sink, if any, with this session under the
    /// `"connection"` key unless `context` already has one.
    pub fn log(&self, level: Level, message: &str, mut context: LogContext) {
        let Some(logger) = &self.logger else {
            return;
        };
        if !context.contains_key(SESSION_KEY) {
            context.insert(SESSION_KEY.to_string(), self.describe());
        }
        logger.log(level, message, &context);
    }

    /// Log `err` at `level` and hand it back for returning.
    pub(crate) fn fail(&self, level: Level, err: ConnectionError) -> ConnectionError {
        let mut context = LogContext::new();
        if let Some(source) = err.driver_error() {
            context.insert("error".to_string(), JsonValue::from(source.to_string()));
        }
        if let Some(sql) = err.sql() {
            context.insert("sql".to_string(), JsonValue::from(sql));
        }
        self.log(level, &err.to_string(), context);
        err
    }

    fn describe(&self) -> JsonValue {
        json!({
            "id": self.id.to_string(),
            "target": self.config.target().to_string(),
        })
    }

    pub fn set_logger(&mut self, logger: Option<Arc<dyn LogSink>>) {
        self.logger = logger;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity_mapper(&self) -> Option<&Arc<dyn IdentityMapper>> {
        self.identity_mapper.as_ref()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<D: Driver> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.config.target())
            .field("connected", &self.is_connected())
            .field("statements", &self.statements.len())
            .field("maps", &self.maps.len())
            .field("savepoints", &self.savepoints)
            .finish()
    }
}
