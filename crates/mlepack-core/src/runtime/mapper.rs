//! # Row Mapper
//!
//! Lazy, chainable view over a query's rows. Each row becomes a [`Record`]
//! keyed by lower-cased column name; `map` queues a transform, `reduce` folds
//! without materialising, and `eject` materialises once and hands back the
//! same slice on every later call.

use super::RowSet;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::cell::OnceCell;
use std::fmt;

/// One row, keyed by lower-cased column name in select-list order.
pub type Record = serde_json::Map<String, Value>;

type Transform = Box<dyn Fn(Record) -> Record>;

pub struct RowMapper {
    rows: Vec<Vec<Value>>,
    fields: Vec<(String, usize)>,
    transforms: Vec<Transform>,
    materialized: OnceCell<Vec<Record>>,
}

impl RowMapper {
    #[must_use]
    pub fn new(set: RowSet) -> Self {
        let fields = set
            .columns
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.to_lowercase(), idx))
            .collect();
        Self {
            rows: set.rows,
            fields,
            transforms: Vec::new(),
            materialized: OnceCell::new(),
        }
    }

    /// Queue a per-record transform. Applied in order on materialisation.
    ///
    /// Consumes `self` and returns a new mapper with no materialisation, so
    /// records already ejected are never returned with the new transform
    /// missing.
    #[must_use]
    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Record) -> Record + 'static,
    {
        let mut transforms = self.transforms;
        transforms.push(Box::new(f));
        Self {
            rows: self.rows,
            fields: self.fields,
            transforms,
            materialized: OnceCell::new(),
        }
    }

    /// Fold over the transformed records without materialising them.
    pub fn reduce<A, F>(&self, f: F, seed: A) -> A
    where
        F: FnMut(A, Record) -> A,
    {
        self.rows.iter().map(|row| self.transformed(row)).fold(seed, f)
    }

    /// Materialise the transformed records. Later calls return the same slice.
    pub fn eject(&self) -> &[Record] {
        self.materialized
            .get_or_init(|| self.rows.iter().map(|row| self.transformed(row)).collect())
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.get().is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Lower-cased column names in select-list order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    /// The materialised records as a JSON array.
    pub fn to_value(&self) -> Value {
        Value::Array(self.eject().iter().cloned().map(Value::Object).collect())
    }

    fn record(&self, row: &[Value]) -> Record {
        self.fields
            .iter()
            .map(|(name, idx)| (name.clone(), row.get(*idx).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    fn transformed(&self, row: &[Value]) -> Record {
        self.transforms
            .iter()
            .fold(self.record(row), |record, transform| transform(record))
    }
}

impl Serialize for RowMapper {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.eject())
    }
}

impl fmt::Debug for RowMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowMapper")
            .field("fields", &self.fields)
            .field("rows", &self.rows.len())
            .field("transforms", &self.transforms.len())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> RowMapper {
        RowMapper::new(RowSet {
            columns: vec!["ID".into(), "NAME".into()],
            rows: vec![vec![json!(1), json!("ada")], vec![json!(2), json!("linus")]],
        })
    }

    #[test]
    fn records_use_lower_case_keys() {
        let mapper = people();
        let rows = mapper.eject();
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
        assert_eq!(rows[1].get("name"), Some(&json!("linus")));
    }

    #[test]
    fn eject_returns_the_same_materialisation() {
        let mapper = people();
        let first = mapper.eject().as_ptr();
        let second = mapper.eject().as_ptr();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn map_is_lazy_and_chained_in_order() {
        let mapper = people()
            .map(|mut r| {
                r.insert("tag".into(), json!("x"));
                r
            })
            .map(|mut r| {
                let tag = r.get("tag").cloned().unwrap_or(Value::Null);
                r.insert("tag2".into(), tag);
                r
            });
        assert!(!mapper.is_materialized());
        assert_eq!(mapper.eject()[0].get("tag2"), Some(&json!("x")));
    }

    #[test]
    fn map_after_eject_starts_a_fresh_materialisation() {
        let mapper = people();
        assert_eq!(mapper.eject()[0].get("tag"), None);
        assert!(mapper.is_materialized());

        let tagged = mapper.map(|mut r| {
            r.insert("tag".into(), json!("x"));
            r
        });
        assert!(!tagged.is_materialized());
        assert_eq!(tagged.eject()[1].get("tag"), Some(&json!("x")));
    }

    #[test]
    fn reduce_does_not_materialise() {
        let mapper = people();
        let total = mapper.reduce(|acc, r| acc + r.get("id").and_then(Value::as_i64).unwrap_or(0), 0);
        assert_eq!(total, 3);
        assert!(!mapper.is_materialized());
    }

    #[test]
    fn serializes_as_array_of_records() {
        let json = serde_json::to_string(&people()).expect("serialize");
        assert_eq!(json, r#"[{"id":1,"name":"ada"},{"id":2,"name":"linus"}]"#);
    }
}
