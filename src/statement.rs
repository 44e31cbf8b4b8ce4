//! Prepared statement management and caching.
//!
//! This module provides:
//! - `Signature`: cache key derived from the exact SQL text
//! - `PreparedQuery`: an immutable statement with a session-unique name
//! - `StatementCache`: per-session map from signature to statement
//!
//! No normalization is applied: `SELECT 1` and `select 1` are different
//! statements. Entries are never evicted; the cache lives as long as the
//! session that owns it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::driver::{Driver, QueryResult};
use crate::error::Result;
use crate::pg::types::Value;
use crate::session::Session;

/// Cache key for a SQL text. Computed without any server round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn of(sql: &str) -> Self {
        Signature(sql.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Prepared Query
// ============================================================================

/// A statement bound to the session whose cache created it.
///
/// The server-side statement is created on the first execution against the
/// current handle, so a query can be obtained before any connection exists.
#[derive(Debug)]
pub struct PreparedQuery {
    signature: Signature,
    /// Server-side name (e.g., "__ps_3"), unique within the session
    name: String,
    sql: String,
}

impl PreparedQuery {
    pub(crate) fn new(name: String, sql: &str) -> Self {
        Self {
            signature: Signature::of(sql),
            name,
            sql: sql.to_string(),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Execute with positional parameters on `session`.
    pub fn execute<D: Driver>(&self, session: &mut Session<D>, values: &[Value]) -> Result<QueryResult> {
        session.execute_prepared(self, values)
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

#[derive(Debug, Default)]
pub struct StatementCache {
    queries: HashMap<Signature, Arc<PreparedQuery>>,
    /// Counter for generating unique statement names
    next_id: u32,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached statement for `sql`, created on a miss.
    pub fn get_or_create(&mut self, sql: &str) -> Arc<PreparedQuery> {
        let signature = Signature::of(sql);
        if let Some(query) = self.queries.get(&signature) {
            return Arc::clone(query);
        }

        let query = Arc::new(self.create(sql));
        tracing::debug!(statement = query.name(), sql, "statement cached");
        self.queries.insert(signature, Arc::clone(&query));
        query
    }

    /// A statement with a fresh name that is not registered in the cache.
    pub fn create(&mut self, sql: &str) -> PreparedQuery {
        PreparedQuery::new(self.next_statement_name(), sql)
    }

    #[inline]
    pub fn contains(&self, signature: &Signature) -> bool {
        self.queries.contains_key(signature)
    }

    pub fn get(&self, signature: &Signature) -> Option<Arc<PreparedQuery>> {
        self.queries.get(signature).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    fn next_statement_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("__ps_{}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_text_same_statement() {
        let mut cache = StatementCache::new();
        let a = cache.get_or_create("SELECT 1");
        let b = cache.get_or_create("SELECT 1");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&Signature::of("SELECT 1")));
    }

    #[test]
    fn test_no_normalization() {
        let mut cache = StatementCache::new();
        let texts = ["SELECT 1", "select 1", "SELECT  1", " SELECT 1", "SELECT 1\n"];
        let names: std::collections::HashSet<_> = texts
            .iter()
            .map(|t| cache.get_or_create(t).name().to_string())
            .collect();

        assert_eq!(names.len(), texts.len());
        assert_eq!(cache.len(), texts.len());
        assert_ne!(Signature::of("SELECT 1"), Signature::of("select 1"));
    }

    #[test]
    fn test_uncached_statements_get_fresh_names() {
        let mut cache = StatementCache::new();
        let cached = cache.get_or_create("SELECT 1");
        let loose = cache.create("SELECT 1");

        assert_ne!(cached.name(), loose.name());
        assert_eq!(cached.signature(), loose.signature());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_has_no_side_effects() {
        let cache = StatementCache::new();
        assert!(!cache.contains(&Signature::of("SELECT 2")));
        assert!(cache.get(&Signature::of("SELECT 2")).is_none());
        assert!(cache.is_empty());
    }
}
