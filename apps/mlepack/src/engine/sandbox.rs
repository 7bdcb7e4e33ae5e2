//! # Sandbox Engine
//!
//! An in-process engine for local runs and tests. It understands exactly the
//! statement shapes the pipeline and the session operations issue:
//!
//! - `INSERT INTO t (cols) VALUES (...)`, `UPDATE t SET c = v [WHERE ...]`,
//!   `DELETE FROM t [WHERE ...]`
//! - `SELECT list FROM t [WHERE c = v]`, including `cast(c as date) AS "c"`
//!   items and `(SELECT max(c) FROM t WHERE ...)` operands
//! - the column catalog lookup
//! - `CREATE OR REPLACE JAVASCRIPT SOURCE NAMED ...` (register)
//! - `CREATE OR REPLACE FUNCTION|PROCEDURE ... AS LANGUAGE JAVASCRIPT NAME ...`
//! - `call f(...) INTO :out` and `SELECT f(...) FROM dual`
//!
//! Placeholders bind positionally. Registering a source loads the newest
//! module row through the [`Script`] evaluator, which fills that source's
//! [`Dispatcher`] with the exported functions named in the row's types. The
//! host may also install its own dispatcher for a source; an installed one
//! takes precedence. Wrapper calls run through it with a [`SqlRuntime`] over
//! this engine.

use super::{Connection, ConnectionOptions, Connector, Execution};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use mlepack_core::{
    BindValue, ColumnInfo, Dispatcher, EngineError, MleError, QueryOutcome, RowSet, SchemaCache,
    Script, SqlConnection, SqlRuntime, descriptors_from_json,
};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, RwLock};

// =============================================================================
// ERROR CODES
// =============================================================================

const INVALID_SQL: i32 = 900;
const INVALID_IDENTIFIER: i32 = 904;
const TABLE_NOT_FOUND: i32 = 942;
const NAME_IN_USE: i32 = 955;
const NOT_ALL_BOUND: i32 = 1008;
const LOGON_DENIED: i32 = 1017;
const NO_DATA_FOUND: i32 = 1403;
const OBJECT_INVALID: i32 = 4063;
const SCRIPT_ERROR: i32 = 4161;
const VALUE_ERROR: i32 = 6502;
const WRONG_ARGUMENTS: i32 = 6553;

/// Column name given to the identity column of a module table.
pub const MODULE_ID_COLUMN: &str = "MODULE_ID";

// =============================================================================
// STATEMENT SHAPES
// =============================================================================

const IDENT: &str = r"[A-Za-z_][\w$#]*";

fn pattern(src: &str) -> Regex {
    Regex::new(&src.replace("{IDENT}", IDENT)).expect("sandbox statement pattern")
}

static CALL: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?is)^call\s+({IDENT})\s*\((.*)\)\s+into\s+:\w+$"));

static DUAL: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?is)^select\s+({IDENT})\s*\((.*)\)\s+from\s+dual$"));

static CREATE_SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r#"(?is)^create\s+or\s+replace\s+javascript\s+source\s+named\s+"((?:[^"]|"")+)"\s+using\s+clob\s+select\s+source\s+from\s+({IDENT})\s+where\s+module_id\s*=\s*\(\s*select\s+max\s*\(\s*module_id\s*\)\s+from\s+({IDENT})\s+where\s+name\s*=\s*'((?:[^']|'')*)'\s*\)$"#,
    )
});

static CREATE_CALLABLE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?is)^create\s+or\s+replace\s+(function|procedure)\s+({IDENT})\s*(?:\(([^)]*)\))?\s*(?:return\s+(\w+)\s+)?as\s+language\s+javascript\s+name\s+'((?:[^']|'')*)'$",
    )
});

static CATALOG: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?is)^select\s+column_name\s*,\s*data_type\s+from\s+all_tab_columns\s+where\s+table_name\s*=\s*:\w+\s+and\s+owner\s*=\s*'([^']*)'",
    )
});

static INSERT: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?is)^insert\s+into\s+({IDENT})\s*\(([^)]*)\)\s*values\s*\((.*)\)$")
});

static SELECT: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?is)^select\s+(.+?)\s+from\s+({IDENT})(?:\s+where\s+(.+))?$")
});

static UPDATE: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?is)^update\s+({IDENT})\s+set\s+({IDENT})\s*=\s*(.+?)(?:\s+where\s+(.+))?$")
});

static DELETE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?is)^delete\s+from\s+({IDENT})(?:\s+where\s+(.+))?$"));

static CONDITION: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?is)^({IDENT})\s*=\s*(.+)$"));

static MAX_SUBQUERY: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?is)^\(\s*select\s+max\s*\(\s*({IDENT})\s*\)\s+from\s+({IDENT})(?:\s+where\s+(.+?))?\s*\)$")
});

static CAST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r#"(?is)^cast\s*\(\s*({IDENT})\s+as\s+date\s*\)\s+as\s+"([^"]+)"$"#)
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| pattern(r"^{IDENT}$"));

// =============================================================================
// STATE
// =============================================================================

#[derive(Debug, Clone)]
struct Table {
    columns: Vec<ColumnInfo>,
    rows: Vec<Vec<Value>>,
    identity: Option<usize>,
    next_id: i64,
}

impl Table {
    fn column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Returns {
    Number,
    Text,
    Nothing,
}

#[derive(Debug, Clone)]
struct Wrapper {
    returns: Returns,
    arity: usize,
    source: String,
    function: String,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    sources: BTreeMap<String, String>,
    wrappers: BTreeMap<String, Wrapper>,
    journal: Vec<String>,
}

/// Positional bind cursor.
struct Binds<'a> {
    values: &'a [BindValue],
    next: usize,
}

impl<'a> Binds<'a> {
    fn new(values: &'a [BindValue]) -> Self {
        Self { values, next: 0 }
    }

    fn take(&mut self) -> Result<Value, EngineError> {
        let value = self
            .values
            .get(self.next)
            .ok_or_else(|| EngineError::new(NOT_ALL_BOUND, "not all variables bound"))?;
        self.next += 1;
        match value {
            BindValue::OutText => Err(EngineError::new(
                NOT_ALL_BOUND,
                "output bind used in an input position",
            )),
            other => Ok(other.to_json()),
        }
    }

    fn take_out(&mut self) -> Result<(), EngineError> {
        match self.values.get(self.next) {
            Some(BindValue::OutText) => {
                self.next += 1;
                Ok(())
            }
            _ => Err(EngineError::new(NOT_ALL_BOUND, "missing output bind")),
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// In-process engine. Shared by every connection it hands out.
pub struct SandboxEngine {
    owner: String,
    cache: Arc<SchemaCache>,
    state: Mutex<State>,
    installed: RwLock<BTreeMap<String, Arc<Dispatcher>>>,
    loaded: RwLock<BTreeMap<String, Arc<Dispatcher>>>,
}

impl SandboxEngine {
    /// Create an empty engine. Catalog lookups answer for the cache's owner.
    #[must_use]
    pub fn new(cache: Arc<SchemaCache>) -> Self {
        Self {
            owner: cache.owner().to_string(),
            cache,
            state: Mutex::new(State::default()),
            installed: RwLock::new(BTreeMap::new()),
            loaded: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a table. Names are case-insensitive.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnInfo>) -> Result<(), EngineError> {
        let mut state = self.lock();
        let key = name.to_uppercase();
        if state.tables.contains_key(&key) {
            return Err(EngineError::new(
                NAME_IN_USE,
                format!("name {key} is already used by an existing object"),
            ));
        }
        let columns = columns
            .into_iter()
            .map(|c| ColumnInfo::new(c.name.to_uppercase(), c.declared_type.to_uppercase()))
            .collect::<Vec<_>>();
        let identity = columns.iter().position(|c| c.name == MODULE_ID_COLUMN);
        state.tables.insert(
            key,
            Table {
                columns,
                rows: Vec::new(),
                identity,
                next_id: 1,
            },
        );
        Ok(())
    }

    /// Create a module table: `(module_id, name, types, source)`.
    pub fn create_module_table(&self, name: &str) -> Result<(), EngineError> {
        self.create_table(
            name,
            vec![
                ColumnInfo::new(MODULE_ID_COLUMN, "NUMBER"),
                ColumnInfo::new("NAME", "VARCHAR2"),
                ColumnInfo::new("TYPES", "CLOB"),
                ColumnInfo::new("SOURCE", "CLOB"),
            ],
        )
    }

    /// Append a row given in column order.
    pub fn insert_row(&self, table: &str, values: Vec<Value>) -> Result<(), EngineError> {
        let mut state = self.lock();
        let t = state
            .tables
            .get_mut(&table.to_uppercase())
            .ok_or_else(|| table_not_found(table, 0))?;
        if values.len() != t.columns.len() {
            return Err(EngineError::new(
                INVALID_SQL,
                format!("expected {} values, got {}", t.columns.len(), values.len()),
            ));
        }
        t.rows.push(values);
        Ok(())
    }

    /// Install a host implementation of a source object's exports. It is used
    /// instead of the functions loaded from the registered source.
    pub fn install_module(&self, source_name: impl Into<String>, dispatcher: Dispatcher) {
        let mut installed = self.installed.write().unwrap_or_else(|e| e.into_inner());
        installed.insert(source_name.into(), Arc::new(dispatcher));
    }

    /// Exported names the registered source `name` loaded.
    pub fn loaded_functions(&self, name: &str) -> Vec<String> {
        let loaded = self.loaded.read().unwrap_or_else(|e| e.into_inner());
        loaded
            .get(name)
            .map(|d| d.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Fill the dispatch table of a freshly registered source.
    fn load(&self, registered: Registered) {
        let script = Script::parse(&registered.source);
        let exported = registered
            .types
            .as_deref()
            .and_then(|types| descriptors_from_json(types).ok())
            .map(|descriptors| descriptors.into_iter().map(|d| d.name).collect::<Vec<_>>());
        let names = exported.unwrap_or_else(|| script.names().map(str::to_string).collect());
        let dispatcher = script.into_dispatcher(names);
        tracing::debug!(
            "Loaded source {} with functions {:?}",
            registered.name,
            dispatcher.names().collect::<Vec<_>>()
        );

        let mut loaded = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        loaded.insert(registered.name, Arc::new(dispatcher));
    }

    /// Every statement and commit seen so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.lock().sources.contains_key(name)
    }

    /// Names of the created wrappers, upper-cased.
    pub fn wrappers(&self) -> Vec<String> {
        self.lock().wrappers.keys().cloned().collect()
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.lock()
            .tables
            .get(&table.to_uppercase())
            .map(|t| t.rows.len())
    }

    // =========================================================================
    // STATEMENT DISPATCH
    // =========================================================================

    fn run(&self, sql: &str, binds: &[BindValue]) -> Result<Execution, EngineError> {
        let text = sql.trim().trim_end_matches(';').trim_end();
        self.lock().journal.push(text.to_string());
        let mut binds = Binds::new(binds);

        if let Some(caps) = CALL.captures(text) {
            let args = self.arguments(&caps[2], &mut binds)?;
            binds.take_out()?;
            let value = self.invoke(&caps[1], args)?;
            let out = match value {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            };
            return Ok(Execution {
                outcome: QueryOutcome::Affected(0),
                out_binds: vec![out],
            });
        }

        if let Some(caps) = DUAL.captures(text) {
            let args = self.arguments(&caps[2], &mut binds)?;
            let value = self.invoke(&caps[1], args)?;
            let column = format!("{}({})", &caps[1], caps[2].trim()).to_uppercase();
            return Ok(Execution::new(QueryOutcome::Rows(RowSet {
                columns: vec![column],
                rows: vec![vec![value]],
            })));
        }

        let mut state = self.lock();
        let outcome = if let Some(caps) = CREATE_SOURCE.captures(text) {
            let registered = register_source(&mut state, text, &caps)?;
            self.load(registered);
            QueryOutcome::Affected(0)
        } else if let Some(caps) = CREATE_CALLABLE.captures(text) {
            create_callable(&mut state, &caps)?
        } else if let Some(caps) = CATALOG.captures(text) {
            self.catalog(&state, &caps, &mut binds)?
        } else if let Some(caps) = INSERT.captures(text) {
            insert(&mut state, text, &caps, &mut binds)?
        } else if let Some(caps) = SELECT.captures(text) {
            select(&state, text, &caps, &mut binds)?
        } else if let Some(caps) = UPDATE.captures(text) {
            update(&mut state, text, &caps, &mut binds)?
        } else if let Some(caps) = DELETE.captures(text) {
            delete(&mut state, text, &caps, &mut binds)?
        } else {
            return Err(EngineError::new(INVALID_SQL, "invalid SQL statement").with_offset(0));
        };
        Ok(Execution::new(outcome))
    }

    fn arguments(&self, list: &str, binds: &mut Binds<'_>) -> Result<Vec<Value>, EngineError> {
        let state = self.lock();
        split_list(list)
            .into_iter()
            .filter(|a| !a.trim().is_empty())
            .map(|a| operand(&state, a, binds))
            .collect()
    }

    /// Call a wrapper. The state lock is released before the module runs so
    /// that it can query back through this engine.
    fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, EngineError> {
        let wrapper = {
            let state = self.lock();
            let wrapper = state.wrappers.get(&name.to_uppercase()).cloned().ok_or_else(|| {
                EngineError::new(INVALID_IDENTIFIER, format!("\"{}\": invalid identifier", name.to_uppercase()))
            })?;
            if !state.sources.contains_key(&wrapper.source) {
                return Err(EngineError::new(
                    OBJECT_INVALID,
                    format!("source object \"{}\" does not exist", wrapper.source),
                ));
            }
            wrapper
        };

        if args.len() != wrapper.arity {
            return Err(EngineError::new(
                WRONG_ARGUMENTS,
                format!("wrong number or types of arguments in call to '{}'", name.to_uppercase()),
            ));
        }
        if wrapper.returns == Returns::Nothing {
            return Err(EngineError::new(
                INVALID_IDENTIFIER,
                format!("{} is a procedure and returns no value", name.to_uppercase()),
            ));
        }

        let installed = {
            let installed = self.installed.read().unwrap_or_else(|e| e.into_inner());
            installed.get(&wrapper.source).cloned()
        };
        let dispatcher = installed
            .or_else(|| {
                let loaded = self.loaded.read().unwrap_or_else(|e| e.into_inner());
                loaded.get(&wrapper.source).cloned()
            })
            .ok_or_else(|| {
                EngineError::new(
                    SCRIPT_ERROR,
                    format!("no module loaded for source object \"{}\"", wrapper.source),
                )
            })?;

        let runtime = SqlRuntime::new(self, &self.cache);
        let text = dispatcher
            .evaluate(&runtime, &wrapper.function, &args)
            .map_err(|e| match e {
                MleError::Engine(inner) => inner,
                other => EngineError::new(SCRIPT_ERROR, other.to_string()),
            })?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::new(SCRIPT_ERROR, e.to_string()))?;

        match (wrapper.returns, value) {
            (Returns::Number, v @ Value::Number(_)) => Ok(v),
            (Returns::Number, other) => Err(EngineError::new(
                VALUE_ERROR,
                format!("numeric or value error: {other} is not a number"),
            )),
            (Returns::Text, Value::String(s)) => Ok(Value::String(s)),
            (Returns::Text | Returns::Nothing, other) => Ok(Value::String(other.to_string())),
        }
    }

    fn catalog(
        &self,
        state: &State,
        caps: &Captures<'_>,
        binds: &mut Binds<'_>,
    ) -> Result<QueryOutcome, EngineError> {
        let table = match binds.take()? {
            Value::String(s) => s.to_uppercase(),
            other => other.to_string(),
        };
        let rows = match state.tables.get(&table) {
            Some(t) if caps[1].eq_ignore_ascii_case(&self.owner) => t
                .columns
                .iter()
                .map(|c| vec![Value::String(c.name.clone()), Value::String(c.declared_type.clone())])
                .collect(),
            _ => Vec::new(),
        };
        Ok(QueryOutcome::Rows(RowSet {
            columns: vec!["COLUMN_NAME".into(), "DATA_TYPE".into()],
            rows,
        }))
    }
}

impl SqlConnection for SandboxEngine {
    fn execute(&self, sql: &str, binds: &[BindValue]) -> Result<QueryOutcome, EngineError> {
        self.run(sql, binds).map(|e| e.outcome)
    }
}

#[async_trait]
impl Connection for SandboxEngine {
    async fn execute(&self, sql: &str, binds: &[BindValue]) -> Result<Execution, EngineError> {
        self.run(sql, binds)
    }

    async fn commit(&self) -> Result<(), EngineError> {
        self.lock().journal.push("COMMIT".to_string());
        Ok(())
    }
}

// =============================================================================
// STATEMENTS
// =============================================================================

/// A source object created from the newest row of a module table.
struct Registered {
    name: String,
    source: String,
    types: Option<String>,
}

fn register_source(
    state: &mut State,
    text: &str,
    caps: &Captures<'_>,
) -> Result<Registered, EngineError> {
    let name = caps[1].replace("\"\"", "\"");
    let lookup = caps[4].replace("''", "'");
    let table_name = &caps[2];
    let table = state
        .tables
        .get(&table_name.to_uppercase())
        .ok_or_else(|| table_not_found(table_name, position(text, caps, 2)))?;

    let (id_col, name_col, source_col) =
        match (table.identity, table.column("NAME"), table.column("SOURCE")) {
            (Some(i), Some(n), Some(s)) => (i, n, s),
            _ => {
                return Err(EngineError::new(
                    INVALID_IDENTIFIER,
                    format!("{} is not a module table", table_name.to_uppercase()),
                ));
            }
        };

    let newest = table
        .rows
        .iter()
        .filter(|row| row.get(name_col).and_then(Value::as_str) == Some(lookup.as_str()))
        .max_by_key(|row| row.get(id_col).and_then(Value::as_i64).unwrap_or(i64::MIN))
        .ok_or_else(|| EngineError::new(NO_DATA_FOUND, "no data found"))?;
    let source = newest
        .get(source_col)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::new(NO_DATA_FOUND, "no data found"))?;
    let types = table
        .column("TYPES")
        .and_then(|col| newest.get(col))
        .and_then(Value::as_str)
        .map(str::to_string);

    state.sources.insert(name.clone(), source.clone());
    Ok(Registered {
        name,
        source,
        types,
    })
}

fn create_callable(state: &mut State, caps: &Captures<'_>) -> Result<QueryOutcome, EngineError> {
    let name = caps[2].to_uppercase();
    let arity = caps
        .get(3)
        .map_or(0, |m| split_list(m.as_str()).iter().filter(|p| !p.trim().is_empty()).count());
    let returns = match (caps[1].to_ascii_lowercase().as_str(), caps.get(4)) {
        ("procedure", _) => Returns::Nothing,
        (_, Some(ty)) if ty.as_str().eq_ignore_ascii_case("NUMBER") => Returns::Number,
        (_, Some(_)) => Returns::Text,
        (_, None) => {
            return Err(EngineError::new(INVALID_SQL, "function without RETURN clause"));
        }
    };

    let target = caps[5].replace("''", "'");
    let call = target.split('(').next().unwrap_or_default();
    let split = last_unescaped_dot(call).ok_or_else(|| {
        EngineError::new(INVALID_SQL, format!("invalid call target '{call}'"))
    })?;
    let source = call[..split].replace("\\.", ".");
    let function = call[split + 1..].to_string();

    if !state.sources.contains_key(&source) {
        return Err(EngineError::new(
            OBJECT_INVALID,
            format!("source object \"{source}\" does not exist"),
        ));
    }

    state.wrappers.insert(
        name,
        Wrapper {
            returns,
            arity,
            source,
            function,
        },
    );
    Ok(QueryOutcome::Affected(0))
}

fn insert(
    state: &mut State,
    text: &str,
    caps: &Captures<'_>,
    binds: &mut Binds<'_>,
) -> Result<QueryOutcome, EngineError> {
    let table_name = &caps[1];
    let columns = split_list(&caps[2]);
    let values = split_list(&caps[3])
        .into_iter()
        .map(|v| operand(state, v, binds))
        .collect::<Result<Vec<_>, _>>()?;
    if columns.len() != values.len() {
        return Err(EngineError::new(INVALID_SQL, "column and value counts differ"));
    }

    let offset = position(text, caps, 1);
    let table = state
        .tables
        .get_mut(&table_name.to_uppercase())
        .ok_or_else(|| table_not_found(table_name, offset))?;

    let mut row = vec![Value::Null; table.columns.len()];
    for (col, value) in columns.iter().zip(values) {
        let idx = table.column(col.trim()).ok_or_else(|| invalid_identifier(col.trim(), offset))?;
        row[idx] = value;
    }
    if let Some(id) = table.identity {
        if row[id].is_null() {
            row[id] = Value::from(table.next_id);
        }
        if let Some(n) = row[id].as_i64() {
            table.next_id = table.next_id.max(n + 1);
        }
    }
    table.rows.push(row);
    Ok(QueryOutcome::Affected(1))
}

fn select(
    state: &State,
    text: &str,
    caps: &Captures<'_>,
    binds: &mut Binds<'_>,
) -> Result<QueryOutcome, EngineError> {
    let table_name = &caps[2];
    let table = state
        .tables
        .get(&table_name.to_uppercase())
        .ok_or_else(|| table_not_found(table_name, position(text, caps, 2)))?;

    enum Pick {
        Plain(usize),
        AsDate(usize),
    }

    let mut columns = Vec::new();
    let mut picks = Vec::new();
    for item in split_list(&caps[1]) {
        let item = item.trim();
        if item == "*" {
            for (idx, c) in table.columns.iter().enumerate() {
                columns.push(c.name.clone());
                picks.push(Pick::Plain(idx));
            }
        } else if let Some(cast) = CAST_ITEM.captures(item) {
            let idx = table
                .column(&cast[1])
                .ok_or_else(|| invalid_identifier(&cast[1], text.find(item).unwrap_or(0)))?;
            columns.push(cast[2].to_string());
            picks.push(Pick::AsDate(idx));
        } else if IDENTIFIER.is_match(item) {
            let idx = table
                .column(item)
                .ok_or_else(|| invalid_identifier(item, text.find(item).unwrap_or(0)))?;
            columns.push(item.to_uppercase());
            picks.push(Pick::Plain(idx));
        } else {
            return Err(invalid_identifier(item, text.find(item).unwrap_or(0)));
        }
    }

    let matching = filter(state, table, caps.get(3).map(|m| m.as_str()), binds)?;
    let rows = matching
        .into_iter()
        .map(|r| {
            let row = &table.rows[r];
            picks
                .iter()
                .map(|p| match p {
                    Pick::Plain(i) => row[*i].clone(),
                    Pick::AsDate(i) => as_date(&row[*i]),
                })
                .collect()
        })
        .collect();

    Ok(QueryOutcome::Rows(RowSet { columns, rows }))
}

fn update(
    state: &mut State,
    text: &str,
    caps: &Captures<'_>,
    binds: &mut Binds<'_>,
) -> Result<QueryOutcome, EngineError> {
    let table_name = &caps[1];
    let offset = position(text, caps, 1);
    let value = operand(state, &caps[3], binds)?;
    let (matching, idx) = {
        let table = state
            .tables
            .get(&table_name.to_uppercase())
            .ok_or_else(|| table_not_found(table_name, offset))?;
        let idx = table
            .column(&caps[2])
            .ok_or_else(|| invalid_identifier(&caps[2], position(text, caps, 2)))?;
        (filter(state, table, caps.get(4).map(|m| m.as_str()), binds)?, idx)
    };

    let table = state
        .tables
        .get_mut(&table_name.to_uppercase())
        .ok_or_else(|| table_not_found(table_name, offset))?;
    for r in &matching {
        table.rows[*r][idx] = value.clone();
    }
    Ok(QueryOutcome::Affected(matching.len() as u64))
}

fn delete(
    state: &mut State,
    text: &str,
    caps: &Captures<'_>,
    binds: &mut Binds<'_>,
) -> Result<QueryOutcome, EngineError> {
    let table_name = &caps[1];
    let offset = position(text, caps, 1);
    let matching = {
        let table = state
            .tables
            .get(&table_name.to_uppercase())
            .ok_or_else(|| table_not_found(table_name, offset))?;
        filter(state, table, caps.get(2).map(|m| m.as_str()), binds)?
    };

    let table = state
        .tables
        .get_mut(&table_name.to_uppercase())
        .ok_or_else(|| table_not_found(table_name, offset))?;
    let mut idx = 0usize;
    table.rows.retain(|_| {
        let keep = !matching.contains(&idx);
        idx += 1;
        keep
    });
    Ok(QueryOutcome::Affected(matching.len() as u64))
}

// =============================================================================
// EXPRESSIONS
// =============================================================================

/// Indices of the rows satisfying an optional `col = operand` condition.
fn filter(
    state: &State,
    table: &Table,
    condition: Option<&str>,
    binds: &mut Binds<'_>,
) -> Result<Vec<usize>, EngineError> {
    let Some(condition) = condition else {
        return Ok((0..table.rows.len()).collect());
    };
    let caps = CONDITION
        .captures(condition.trim())
        .ok_or_else(|| EngineError::new(INVALID_SQL, format!("unsupported condition '{condition}'")))?;
    let idx = table
        .column(&caps[1])
        .ok_or_else(|| invalid_identifier(&caps[1], 0))?;
    let wanted = operand(state, &caps[2], binds)?;

    Ok(table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| loose_eq(&row[idx], &wanted))
        .map(|(i, _)| i)
        .collect())
}

fn operand(state: &State, text: &str, binds: &mut Binds<'_>) -> Result<Value, EngineError> {
    let t = text.trim();
    if t.starts_with(':') {
        return binds.take();
    }
    if let Some(caps) = MAX_SUBQUERY.captures(t) {
        let table = state
            .tables
            .get(&caps[2].to_uppercase())
            .ok_or_else(|| table_not_found(&caps[2], 0))?;
        let idx = table
            .column(&caps[1])
            .ok_or_else(|| invalid_identifier(&caps[1], 0))?;
        let rows = filter(state, table, caps.get(3).map(|m| m.as_str()), binds)?;
        return Ok(rows
            .into_iter()
            .filter_map(|r| table.rows[r][idx].as_i64())
            .max()
            .map_or(Value::Null, Value::from));
    }
    literal(t)
}

fn literal(t: &str) -> Result<Value, EngineError> {
    if let Some(inner) = t.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(Value::String(inner.replace("''", "'")));
    }
    if t.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if let Ok(n) = t.parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Some(n) = t.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return Ok(Value::Number(n));
    }
    Err(invalid_identifier(t, 0))
}

/// SQL equality: `NULL` matches nothing; numbers and numeric text compare by value.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.to_string() == y.to_string(),
        },
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim() == n.to_string()
        }
        _ => a == b,
    }
}

/// Date conversion drops sub-second precision from RFC 3339 timestamps.
fn as_date(value: &Value) -> Value {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Value::String(dt.to_utc().to_rfc3339_opts(SecondsFormat::Secs, true)))
            .unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

/// Split on top-level commas, respecting parentheses and quotes.
fn split_list(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn last_unescaped_dot(call: &str) -> Option<usize> {
    let bytes = call.as_bytes();
    (0..bytes.len())
        .rev()
        .find(|&i| bytes[i] == b'.' && (i == 0 || bytes[i - 1] != b'\\'))
}

fn position(text: &str, caps: &Captures<'_>, group: usize) -> usize {
    caps.get(group).map_or(0, |m| m.start().min(text.len()))
}

fn table_not_found(table: &str, offset: usize) -> EngineError {
    EngineError::new(
        TABLE_NOT_FOUND,
        format!("table or view \"{}\" does not exist", table.to_uppercase()),
    )
    .with_offset(offset)
}

fn invalid_identifier(name: &str, offset: usize) -> EngineError {
    EngineError::new(
        INVALID_IDENTIFIER,
        format!("\"{}\": invalid identifier", name.to_uppercase()),
    )
    .with_offset(offset)
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// Hands out connections to one shared [`SandboxEngine`].
///
/// With no accounts registered any credentials are accepted.
pub struct SandboxConnector {
    engine: Arc<SandboxEngine>,
    accounts: BTreeMap<String, String>,
}

impl SandboxConnector {
    #[must_use]
    pub fn new(engine: Arc<SandboxEngine>) -> Self {
        Self {
            engine,
            accounts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_account(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts.insert(user.into().to_uppercase(), password.into());
        self
    }

    pub fn engine(&self) -> &Arc<SandboxEngine> {
        &self.engine
    }
}

#[async_trait]
impl Connector for SandboxConnector {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Connection>, EngineError> {
        if !self.accounts.is_empty()
            && self.accounts.get(&options.user.to_uppercase()) != Some(&options.password)
        {
            return Err(EngineError::new(
                LOGON_DENIED,
                "invalid username/password; logon denied",
            ));
        }
        tracing::debug!("Sandbox connection opened for user {}", options.user);
        let conn: Arc<dyn Connection> = self.engine.clone();
        Ok(conn)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> SandboxEngine {
        let engine = SandboxEngine::new(Arc::new(SchemaCache::default()));
        engine.create_module_table("mlemodules").expect("module table");
        engine
    }

    fn exec(engine: &SandboxEngine, sql: &str, binds: &[BindValue]) -> Result<QueryOutcome, EngineError> {
        SqlConnection::execute(engine, sql, binds)
    }

    const REGISTER: &str = "CREATE OR REPLACE JAVASCRIPT SOURCE NAMED \"app\" USING CLOB SELECT source FROM mlemodules WHERE module_id = (SELECT max(module_id) FROM mlemodules WHERE name = 'app');";

    #[test]
    fn register_without_loaded_row_fails() {
        let err = exec(&engine(), REGISTER, &[]).expect_err("no row");
        assert_eq!(err.code, Some(NO_DATA_FOUND));
    }

    #[test]
    fn insert_assigns_increasing_module_ids() {
        let e = engine();
        let insert = "INSERT INTO mlemodules (name, types, source) VALUES (:name, :types, :src)";
        for src in ["v1", "v2"] {
            exec(&e, insert, &["app".into(), "[]".into(), src.into()]).expect("insert");
        }
        exec(&e, REGISTER, &[]).expect("register");

        let outcome = exec(
            &e,
            "SELECT types FROM mlemodules WHERE module_id=(SELECT MAX(module_id) FROM mlemodules WHERE name='app')",
            &[],
        )
        .expect("select");
        assert!(matches!(outcome, QueryOutcome::Rows(ref set) if set.rows.len() == 1));
        assert!(e.has_source("app"));
    }

    #[test]
    fn registered_source_dispatches_exported_functions() {
        let e = engine();
        let insert = "INSERT INTO mlemodules (name, types, source) VALUES (:name, :types, :src)";
        let types = r#"[{"name":"twice","parameters":[{"name":"x","type":1}],"returnType":1}]"#;
        let source = "function helper(x) { return x + x; }\nfunction twice(x) { return helper(x); }";
        exec(&e, insert, &["app".into(), types.into(), source.into()]).expect("insert");
        exec(&e, REGISTER, &[]).expect("register");
        exec(
            &e,
            "CREATE OR REPLACE FUNCTION twice(x NUMBER) RETURN NUMBER AS LANGUAGE JAVASCRIPT NAME 'app.twice(x number)'",
            &[],
        )
        .expect("wrapper");

        assert_eq!(e.loaded_functions("app"), vec!["twice"]);
        let outcome = exec(&e, "SELECT twice(:in0) FROM dual", &[BindValue::from(21)]).expect("call");
        let QueryOutcome::Rows(set) = outcome else {
            unreachable!("dual select returns rows");
        };
        assert_eq!(set.rows[0][0], json!(42));
    }

    #[test]
    fn installed_module_takes_precedence_over_loaded_source() {
        let e = engine();
        let insert = "INSERT INTO mlemodules (name, types, source) VALUES (:name, :types, :src)";
        exec(&e, insert, &["app".into(), "not json".into(), "const one = () => 1;".into()])
            .expect("insert");
        exec(&e, REGISTER, &[]).expect("register");
        exec(
            &e,
            "CREATE OR REPLACE FUNCTION one RETURN NUMBER AS LANGUAGE JAVASCRIPT NAME 'app.one()'",
            &[],
        )
        .expect("wrapper");
        assert_eq!(e.loaded_functions("app"), vec!["one"]);

        let select = |e: &SandboxEngine| match exec(e, "SELECT one() FROM dual", &[]).expect("call") {
            QueryOutcome::Rows(set) => set.rows[0][0].clone(),
            QueryOutcome::Affected(_) => Value::Null,
        };
        assert_eq!(select(&e), json!(1));

        let mut host = Dispatcher::new();
        host.register("one", |_, _| Ok(json!(100)));
        e.install_module("app", host);
        assert_eq!(select(&e), json!(100));
    }

    #[test]
    fn unknown_table_reports_offset() {
        let err = exec(&engine(), "SELECT * FROM missing", &[]).expect_err("missing");
        assert_eq!(err.code, Some(TABLE_NOT_FOUND));
        assert_eq!(err.offset, Some(14));
    }

    #[test]
    fn cast_items_truncate_fractional_seconds() {
        let e = engine();
        e.create_table("t", vec![ColumnInfo::new("CREATED", "TIMESTAMP(6)")])
            .expect("table");
        e.insert_row("t", vec![json!("2021-03-04T05:06:07.891Z")]).expect("row");

        let outcome = exec(&e, "SELECT cast(CREATED as date) AS \"CREATED\" FROM T", &[]).expect("select");
        let QueryOutcome::Rows(set) = outcome else {
            unreachable!("select returns rows");
        };
        assert_eq!(set.columns, vec!["CREATED"]);
        assert_eq!(set.rows[0][0], json!("2021-03-04T05:06:07Z"));
    }

    #[test]
    fn update_and_delete_report_affected_rows() {
        let e = engine();
        e.create_table("t", vec![ColumnInfo::new("ID", "NUMBER"), ColumnInfo::new("V", "VARCHAR2")])
            .expect("table");
        for id in 1..=3 {
            e.insert_row("t", vec![json!(id), json!("a")]).expect("row");
        }

        let updated = exec(&e, "UPDATE t SET v = 'b'", &[]).expect("update");
        assert_eq!(updated, QueryOutcome::Affected(3));
        let deleted = exec(&e, "DELETE FROM t WHERE id = :in0", &[BindValue::from(2)]).expect("delete");
        assert_eq!(deleted, QueryOutcome::Affected(1));
        assert_eq!(e.row_count("T"), Some(2));
    }

    #[test]
    fn split_list_respects_nesting() {
        assert_eq!(split_list("a, cast(b as date) AS \"b\", 'x,y'"), vec![
            "a",
            " cast(b as date) AS \"b\"",
            " 'x,y'"
        ]);
    }
}
