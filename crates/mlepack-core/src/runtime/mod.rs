//! # Runtime Query Layer
//!
//! What deployed code uses to query data back from the engine:
//!
//! - [`Template`]: literal parts joined by `:in{i}` placeholders
//! - [`SqlRuntime`]: rewrites simple selects against the [`SchemaCache`] and
//!   wraps rows in a [`RowMapper`]
//! - [`Dispatcher`]: exported names mapped to functions registered at load time
//!
//! The connection seam is synchronous; the engine host decides how statements
//! are actually carried.

pub mod mapper;
pub mod schema;
pub mod script;

pub use mapper::{Record, RowMapper};
pub use schema::{ColumnInfo, SchemaCache, SelectShape, match_select, rewrite_select};
pub use script::Script;

use crate::primitives::PLACEHOLDER_PREFIX;
use crate::{BindValue, EngineError, MleError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// CONNECTION SEAM
// =============================================================================

/// Column names plus raw row values, as the engine returns them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// What a single statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(RowSet),
    Affected(u64),
}

/// A connection usable from inside the engine.
pub trait SqlConnection {
    fn execute(&self, sql: &str, binds: &[BindValue]) -> Result<QueryOutcome, EngineError>;
}

/// `"Updated 1 row."`, `"Updated 3 rows."`.
#[must_use]
pub fn status_line(rows: u64) -> String {
    if rows == 1 {
        "Updated 1 row.".to_string()
    } else {
        format!("Updated {rows} rows.")
    }
}

// =============================================================================
// TEMPLATES
// =============================================================================

/// A query template: `parts.len() == args.len() + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<String>,
    args: Vec<BindValue>,
}

impl Template {
    pub fn new<S: Into<String>>(
        parts: impl IntoIterator<Item = S>,
        args: Vec<BindValue>,
    ) -> Result<Self, MleError> {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.len() != args.len() + 1 {
            return Err(MleError::InvalidRequest(format!(
                "template has {} literal parts for {} arguments",
                parts.len(),
                args.len()
            )));
        }
        Ok(Self { parts, args })
    }

    /// A template without arguments.
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![text.into()],
            args: Vec::new(),
        }
    }

    /// The query text with one placeholder per argument.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for (idx, part) in self.parts.iter().enumerate() {
            if idx > 0 {
                out.push_str(&format!("{PLACEHOLDER_PREFIX}{}", idx - 1));
            }
            out.push_str(part);
        }
        out
    }

    pub fn args(&self) -> &[BindValue] {
        &self.args
    }
}

// =============================================================================
// SQL RUNTIME
// =============================================================================

/// The result of [`SqlRuntime::sql`].
#[derive(Debug)]
pub enum QueryResult {
    Rows(RowMapper),
    Status(String),
}

impl QueryResult {
    /// JSON view: the record array or the status string.
    pub fn to_value(&self) -> Value {
        match self {
            QueryResult::Rows(mapper) => mapper.to_value(),
            QueryResult::Status(status) => Value::String(status.clone()),
        }
    }
}

/// Connection plus schema cache, handed to every dispatched function.
#[derive(Clone, Copy)]
pub struct SqlRuntime<'a> {
    conn: &'a dyn SqlConnection,
    cache: &'a SchemaCache,
}

impl<'a> SqlRuntime<'a> {
    #[must_use]
    pub fn new(conn: &'a dyn SqlConnection, cache: &'a SchemaCache) -> Self {
        Self { conn, cache }
    }

    pub fn cache(&self) -> &SchemaCache {
        self.cache
    }

    /// The text actually sent to the engine for `template`.
    pub fn prepare(&self, template: &Template) -> Result<String, MleError> {
        let text = template.text();
        let Some(shape) = match_select(&text) else {
            return Ok(text);
        };
        let columns = self.cache.columns(self.conn, &shape.table)?;
        Ok(rewrite_select(&text, &shape, &columns))
    }

    /// Run a template. Affected-row results become a status string.
    pub fn sql(&self, template: &Template) -> Result<QueryResult, MleError> {
        let text = self.prepare(template)?;
        match self.conn.execute(&text, template.args())? {
            QueryOutcome::Rows(set) => Ok(QueryResult::Rows(RowMapper::new(set))),
            QueryOutcome::Affected(n) => Ok(QueryResult::Status(status_line(n))),
        }
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

pub type Handler =
    Box<dyn Fn(&SqlRuntime<'_>, &[Value]) -> Result<Value, MleError> + Send + Sync>;

/// Name-to-function table populated when a module is loaded.
#[derive(Default)]
pub struct Dispatcher {
    handlers: BTreeMap<String, Handler>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. A later registration of the same name replaces it.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&SqlRuntime<'_>, &[Value]) -> Result<Value, MleError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Call `name` and return its result as JSON text.
    pub fn evaluate(
        &self,
        runtime: &SqlRuntime<'_>,
        name: &str,
        args: &[Value],
    ) -> Result<String, MleError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| MleError::InvalidRequest(format!("{name} is not a registered function")))?;
        let value = handler(runtime, args)?;
        serde_json::to_string(&value).map_err(|e| MleError::Serialization(e.to_string()))
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recording {
        statements: RefCell<Vec<String>>,
    }

    impl SqlConnection for Recording {
        fn execute(&self, sql: &str, _binds: &[BindValue]) -> Result<QueryOutcome, EngineError> {
            self.statements.borrow_mut().push(sql.to_string());
            if sql.contains("ALL_TAB_COLUMNS") {
                return Ok(QueryOutcome::Rows(RowSet {
                    columns: vec!["COLUMN_NAME".into(), "DATA_TYPE".into()],
                    rows: vec![
                        vec![json!("ID"), json!("NUMBER")],
                        vec![json!("CREATED"), json!("TIMESTAMP(6)")],
                    ],
                }));
            }
            if sql.starts_with("UPDATE") {
                return Ok(QueryOutcome::Affected(3));
            }
            Ok(QueryOutcome::Rows(RowSet {
                columns: vec!["ID".into()],
                rows: vec![vec![json!(7)]],
            }))
        }
    }

    #[test]
    fn status_line_is_singular_for_one_row() {
        assert_eq!(status_line(1), "Updated 1 row.");
        assert_eq!(status_line(3), "Updated 3 rows.");
    }

    #[test]
    fn template_numbers_placeholders() {
        let t = Template::new(["SELECT * FROM t WHERE a = ", " AND b = ", ""], vec![
            BindValue::from(1),
            BindValue::from("x"),
        ])
        .expect("template");
        assert_eq!(t.text(), "SELECT * FROM t WHERE a = :in0 AND b = :in1");
    }

    #[test]
    fn template_rejects_mismatched_parts() {
        assert!(Template::new(["a", "b"], vec![]).is_err());
    }

    #[test]
    fn second_query_reuses_cached_columns() {
        let conn = Recording::default();
        let cache = SchemaCache::default();
        let rt = SqlRuntime::new(&conn, &cache);

        rt.sql(&Template::literal("SELECT * FROM t")).expect("first");
        rt.sql(&Template::literal("SELECT * FROM T")).expect("second");

        let lookups = conn
            .statements
            .borrow()
            .iter()
            .filter(|s| s.contains("ALL_TAB_COLUMNS"))
            .count();
        assert_eq!(lookups, 1);
        assert!(
            conn.statements
                .borrow()
                .contains(&"SELECT ID, cast(CREATED as date) AS \"CREATED\" FROM T".to_string())
        );
    }

    #[test]
    fn affected_rows_become_status() {
        let conn = Recording::default();
        let cache = SchemaCache::default();
        let rt = SqlRuntime::new(&conn, &cache);

        let result = rt.sql(&Template::literal("UPDATE t SET a = 1")).expect("update");
        assert!(matches!(result, QueryResult::Status(ref s) if s == "Updated 3 rows."));
    }

    #[test]
    fn dispatcher_evaluates_registered_function() {
        let conn = Recording::default();
        let cache = SchemaCache::default();
        let rt = SqlRuntime::new(&conn, &cache);

        let mut dispatcher = Dispatcher::new();
        dispatcher.register("ids", |rt, _args| {
            Ok(rt.sql(&Template::literal("SELECT id FROM t"))?.to_value())
        });

        let text = dispatcher.evaluate(&rt, "ids", &[]).expect("evaluate");
        assert_eq!(text, r#"[{"id":7}]"#);
        assert!(dispatcher.evaluate(&rt, "missing", &[]).is_err());
    }
}
