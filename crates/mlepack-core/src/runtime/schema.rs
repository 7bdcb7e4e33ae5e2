//! # Schema Cache and Select Rewriting
//!
//! A simple `SELECT <cols> FROM <table>` is rewritten against the table's
//! catalog columns before it reaches the engine:
//!
//! - `*` expands to every catalog column, in catalog order
//! - an explicit list keeps the catalog columns whose name appears in it
//!   (case-insensitive substring match)
//! - temporal columns become `cast(col as date) AS "col"` so the driver hands
//!   back a uniform date representation
//!
//! Column lists are cached per upper-cased table name for the cache's
//! lifetime. Entries are never invalidated; a concurrent first lookup of the
//! same table may query the catalog twice but both writers store the same list
//! and the first one wins.

use super::{QueryOutcome, SqlConnection};
use crate::primitives::{DEFAULT_CATALOG_OWNER, TEMPORAL_TYPE_PREFIX};
use crate::{BindValue, MleError};
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, LazyLock, RwLock};

static SELECT_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bselect\s+(\*|[A-Za-z_][\w$#]*(?:\s*,\s*[A-Za-z_][\w$#]*)*)\s+from\s+([A-Za-z_][\w$#]*)",
    )
    .expect("select pattern")
});

static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bjoin\b").expect("join pattern"));

// =============================================================================
// COLUMN INFO
// =============================================================================

/// One catalog column: name and declared type, as the catalog reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

impl ColumnInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }

    #[must_use]
    pub fn is_temporal(&self) -> bool {
        self.declared_type
            .to_ascii_uppercase()
            .starts_with(TEMPORAL_TYPE_PREFIX)
    }

    /// The select-list expression for this column.
    #[must_use]
    pub fn select_expr(&self) -> String {
        if self.is_temporal() {
            format!("cast({0} as date) AS \"{0}\"", self.name)
        } else {
            self.name.clone()
        }
    }
}

// =============================================================================
// SCHEMA CACHE
// =============================================================================

/// Process-lifetime cache of table columns, keyed by upper-cased table name.
///
/// Constructed once at startup and shared by every session.
#[derive(Debug)]
pub struct SchemaCache {
    owner: String,
    entries: RwLock<HashMap<String, Arc<[ColumnInfo]>>>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(DEFAULT_CATALOG_OWNER)
    }
}

impl SchemaCache {
    /// Create an empty cache whose catalog lookups are restricted to `owner`.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Cached columns for `table`, if populated.
    pub fn get(&self, table: &str) -> Option<Arc<[ColumnInfo]>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&table.to_uppercase()).cloned()
    }

    /// Store the columns for `table`. An existing entry is kept and returned.
    pub fn populate(&self, table: &str, columns: Vec<ColumnInfo>) -> Arc<[ColumnInfo]> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(table.to_uppercase())
            .or_insert_with(|| columns.into())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The catalog query issued on a cache miss.
    #[must_use]
    pub fn catalog_query(&self) -> String {
        format!(
            "select column_name, data_type from ALL_TAB_COLUMNS where table_name = :tablename and owner = '{}' order by column_id",
            self.owner.replace('\'', "''")
        )
    }

    /// Columns for `table`, querying the catalog on a miss.
    ///
    /// An empty catalog answer is returned but not cached, so a table created
    /// later is still picked up.
    pub fn columns(
        &self,
        conn: &dyn SqlConnection,
        table: &str,
    ) -> Result<Arc<[ColumnInfo]>, MleError> {
        if let Some(hit) = self.get(table) {
            return Ok(hit);
        }

        let key = table.to_uppercase();
        let outcome = conn
            .execute(&self.catalog_query(), &[BindValue::Text(key.clone())])
            .map_err(|e| {
                MleError::Operation(format!(
                    "Failure while reading column catalog for table {key}: {e}"
                ))
            })?;

        let columns = match outcome {
            QueryOutcome::Rows(set) => set
                .rows
                .iter()
                .map(|row| match (row.first(), row.get(1)) {
                    (Some(serde_json::Value::String(name)), Some(serde_json::Value::String(ty))) => {
                        Ok(ColumnInfo::new(name, ty))
                    }
                    _ => Err(MleError::Serialization(format!(
                        "unexpected catalog row for table {key}: {row:?}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            QueryOutcome::Affected(_) => {
                return Err(MleError::Operation(format!(
                    "Column catalog lookup for table {key} returned no rows"
                )));
            }
        };

        // No columns means the table is not visible yet; ask again next time.
        if columns.is_empty() {
            return Ok(Arc::from(columns));
        }
        Ok(self.populate(&key, columns))
    }
}

// =============================================================================
// SELECT SHAPE
// =============================================================================

/// A recognised `SELECT <cols> FROM <table>` inside a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectShape {
    /// Byte range of `<cols>` in the query text.
    pub cols: Range<usize>,
    pub table: String,
}

/// Recognise the simple single-table select shape. Joins are not rewritten.
#[must_use]
pub fn match_select(query: &str) -> Option<SelectShape> {
    if JOIN.is_match(query) {
        return None;
    }
    let caps = SELECT_SHAPE.captures(query)?;
    let cols = caps.get(1)?;
    let table = caps.get(2)?;
    if query[table.end()..].trim_start().starts_with(',') {
        return None;
    }
    Some(SelectShape {
        cols: cols.range(),
        table: table.as_str().to_string(),
    })
}

/// Substitute the filtered, rewritten column list for `<cols>`.
///
/// When no catalog column matches, the query is returned unchanged and the
/// engine reports whatever is wrong with it.
#[must_use]
pub fn rewrite_select(query: &str, shape: &SelectShape, columns: &[ColumnInfo]) -> String {
    let requested = &query[shape.cols.clone()];
    let wanted = requested.to_uppercase();
    let star = requested.trim() == "*";

    let list = columns
        .iter()
        .filter(|c| star || wanted.contains(&c.name.to_uppercase()))
        .map(ColumnInfo::select_expr)
        .collect::<Vec<_>>();

    if list.is_empty() {
        return query.to_string();
    }

    let mut out = String::with_capacity(query.len() + 32);
    out.push_str(&query[..shape.cols.start]);
    out.push_str(&list.join(", "));
    out.push_str(&query[shape.cols.end..]);
    out
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn t_columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("ID", "NUMBER"),
            ColumnInfo::new("NAME", "VARCHAR2"),
            ColumnInfo::new("CREATED", "TIMESTAMP(6)"),
        ]
    }

    fn rewrite(query: &str) -> String {
        let shape = match_select(query).expect("shape");
        rewrite_select(query, &shape, &t_columns())
    }

    #[test]
    fn explicit_list_keeps_named_columns() {
        assert_eq!(rewrite("SELECT ID, NAME FROM T"), "SELECT ID, NAME FROM T");
    }

    #[test]
    fn star_expands_and_casts_temporal_columns() {
        assert_eq!(
            rewrite("SELECT * FROM T"),
            "SELECT ID, NAME, cast(CREATED as date) AS \"CREATED\" FROM T"
        );
    }

    #[test]
    fn keywords_match_case_insensitively() {
        let shape = match_select("select created from t where id = :in0").expect("shape");
        assert_eq!(shape.table, "t");
        assert_eq!(
            rewrite_select("select created from t where id = :in0", &shape, &t_columns()),
            "select cast(CREATED as date) AS \"CREATED\" from t where id = :in0"
        );
    }

    #[test]
    fn joins_and_table_lists_are_not_matched() {
        assert!(match_select("SELECT * FROM a JOIN b ON a.id = b.id").is_none());
        assert!(match_select("SELECT * FROM a, b").is_none());
        assert!(match_select("UPDATE t SET x = 1").is_none());
    }

    #[test]
    fn unmatched_columns_leave_query_untouched() {
        assert_eq!(rewrite("SELECT nothing FROM T"), "SELECT nothing FROM T");
    }

    #[test]
    fn cache_keys_are_case_insensitive_and_first_write_wins() {
        let cache = SchemaCache::default();
        cache.populate("t", t_columns());
        let second = cache.populate("T", vec![ColumnInfo::new("OTHER", "NUMBER")]);

        assert_eq!(second.len(), 3);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("t").is_some());
    }

    #[test]
    fn catalog_query_is_restricted_to_owner() {
        let cache = SchemaCache::new("APP");
        assert!(cache.catalog_query().contains("owner = 'APP'"));
    }
}
