//! Prepared statements and the per-connection statement registry.
//!
//! A statement is prepared once under a caller-chosen name and then lives
//! for the rest of the connection. There is no eviction and no
//! re-preparation, so the registry is a plain map.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::error::{BuildError, PgError, PgResult};
use super::protocol::FieldDescription;
use super::query_buf::build_prepared_query_buf;
use super::types::{Oid, PgValue};

/// A statement parsed and described by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    /// Server-side name, unique per connection
    pub name: String,
    /// The SQL text
    pub query: String,
    /// Parameter types from ParameterDescription, in `$n` order
    pub param_types: Vec<Oid>,
    /// Result columns from RowDescription; empty for NoData
    pub columns: Vec<FieldDescription>,
}

impl PreparedStatement {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            param_types: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn param_count(&self) -> usize {
        self.param_types.len()
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Build a ready-to-send Bind+Execute+Sync buffer for `args`.
    pub fn query_buf(&self, args: &[PgValue]) -> Result<Bytes, BuildError> {
        build_prepared_query_buf(self, args)
    }
}

/// Statement name to prepared statement, for one connection.
#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: HashMap<String, Arc<PreparedStatement>>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.get(name).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.statements.contains_key(name)
    }

    /// Register a statement. Names are never overwritten.
    pub fn insert(&mut self, statement: PreparedStatement) -> PgResult<Arc<PreparedStatement>> {
        if self.contains(&statement.name) {
            return Err(PgError::DuplicateStatement(statement.name));
        }
        let statement = Arc::new(statement);
        self.statements
            .insert(statement.name.clone(), Arc::clone(&statement));
        Ok(statement)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.statements.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepared_statement_creation() {
        let mut stmt = PreparedStatement::new("s1", "SELECT $1");
        assert_eq!(stmt.name, "s1");
        assert_eq!(stmt.query, "SELECT $1");
        assert_eq!(stmt.param_count(), 0);
        assert!(!stmt.returns_rows());

        stmt.param_types = vec![Oid::INT4];
        assert_eq!(stmt.param_count(), 1);
    }

    #[test]
    fn test_registry_insert_and_get() {
        let mut registry = StatementRegistry::new();
        assert!(registry.is_empty());

        registry
            .insert(PreparedStatement::new("selectOne", "select 1"))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("selectOne").unwrap().query, "select 1");
        assert!(registry.get("selectTwo").is_none());
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = StatementRegistry::new();
        registry
            .insert(PreparedStatement::new("s", "select 1"))
            .unwrap();

        let err = registry
            .insert(PreparedStatement::new("s", "select 2"))
            .unwrap_err();

        assert!(matches!(err, PgError::DuplicateStatement(ref n) if n == "s"));
        assert_eq!(registry.get("s").unwrap().query, "select 1");
    }

    #[test]
    fn test_registry_names_sorted() {
        let mut registry = StatementRegistry::new();
        for name in ["b", "a", "c"] {
            registry.insert(PreparedStatement::new(name, "select 1")).unwrap();
        }
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }
}
