//! # Sessions
//!
//! One [`Session`] per connected client. It holds at most one engine
//! connection and runs every operation through its [`Gate`], so operations on
//! one session never overlap. Sessions share nothing with each other apart
//! from the connector and the build pipeline.
//!
//! | Operation         | Status label     |
//! |-------------------|------------------|
//! | `configure`       | `connected`      |
//! | `save`            | `saved`          |
//! | `deploy`          | `deployed`       |
//! | `getSchemaTypes`  | `gotTypes`       |
//! | `getTable`        | `gotTable`       |
//! | `executeStatement`| `executed`       |
//! | `executeFunction` | `tested`         |
//! | `executeBatch`    | `testedMultiple` |
//! | `runBenchmark`    | `benchmarked`    |

pub mod benchmark;
pub mod gate;

pub use gate::{Gate, GateOutcome};

use crate::bundle::BundleOptions;
use crate::deploy::{DeploymentExecutor, PackOptions, Pipeline};
use crate::engine::{self, Connection, ConnectionOptions, Connector};
use futures::future::join_all;
use mlepack_core::primitives::MAX_SOURCE_LENGTH;
use mlepack_core::{
    BindValue, GateState, GeneratorConfig, MleError, QueryOutcome, RowMapper,
    descriptors_from_json, status_line,
};
use regex::Regex;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, RwLock};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][\w$#]*$").expect("identifier pattern"));

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Settings every session of a server shares.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// File `save` writes and `deploy` packs.
    pub source_file: PathBuf,
    pub generator: GeneratorConfig,
    pub bundle: BundleOptions,
}

impl SessionConfig {
    fn pack_options(&self) -> PackOptions {
        PackOptions {
            entry: self.source_file.clone(),
            generator: self.generator.clone(),
            bundle: self.bundle.clone(),
        }
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// One `{id, name, params}` case of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCase {
    pub id: Value,
    pub name: String,
    pub params: Vec<Value>,
}

/// A gated session operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Configure(ConnectionOptions),
    Save(String),
    Deploy,
    GetSchemaTypes,
    GetTable(String),
    ExecuteStatement(String),
    ExecuteFunction {
        id: Value,
        name: String,
        params: Vec<Value>,
    },
    ExecuteBatch(Vec<BatchCase>),
    RunBenchmark,
}

impl Operation {
    /// Label attached to a successful result.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Operation::Configure(_) => "connected",
            Operation::Save(_) => "saved",
            Operation::Deploy => "deployed",
            Operation::GetSchemaTypes => "gotTypes",
            Operation::GetTable(_) => "gotTable",
            Operation::ExecuteStatement(_) => "executed",
            Operation::ExecuteFunction { .. } => "tested",
            Operation::ExecuteBatch(_) => "testedMultiple",
            Operation::RunBenchmark => "benchmarked",
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct Session {
    id: u64,
    gate: Gate,
    connector: Arc<dyn Connector>,
    pipeline: Arc<Pipeline>,
    config: Arc<SessionConfig>,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    options: RwLock<Option<ConnectionOptions>>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: u64,
        connector: Arc<dyn Connector>,
        pipeline: Arc<Pipeline>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            id,
            gate: Gate::new(id),
            connector,
            pipeline,
            config,
            connection: RwLock::new(None),
            options: RwLock::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current gate state. Does not go through the gate.
    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    /// Run one operation through the gate.
    ///
    /// A deploy is always followed by a reconnect with the stored options
    /// inside the same gate claim, so it yields two outcomes.
    pub async fn handle(&self, operation: Operation) -> Vec<GateOutcome> {
        let status = operation.status();
        if operation == Operation::Deploy {
            return self
                .gate
                .run_then(status, || self.deploy(), "connected", || async {
                    let options = self.stored_options()?;
                    self.configure(options).await
                })
                .await;
        }
        vec![self.gate.run(status, || self.dispatch(operation)).await]
    }

    async fn dispatch(&self, operation: Operation) -> Result<Value, MleError> {
        match operation {
            Operation::Configure(options) => self.configure(options).await,
            Operation::Save(content) => self.save(&content).await,
            Operation::Deploy => self.deploy().await,
            Operation::GetSchemaTypes => self.get_schema_types().await,
            Operation::GetTable(table) => self.get_table(&table).await,
            Operation::ExecuteStatement(sql) => self.execute_statement(&sql).await,
            Operation::ExecuteFunction { id, name, params } => {
                self.execute_function(id, &name, params).await
            }
            Operation::ExecuteBatch(cases) => self.execute_batch(&cases).await,
            Operation::RunBenchmark => self.run_benchmark().await,
        }
    }

    fn connection(&self) -> Result<Arc<dyn Connection>, MleError> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(MleError::NotConnected)
    }

    fn stored_options(&self) -> Result<ConnectionOptions, MleError> {
        self.options
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(MleError::NotConnected)
    }

    // =========================================================================
    // OPERATION BODIES
    // =========================================================================

    async fn configure(&self, options: ConnectionOptions) -> Result<Value, MleError> {
        *self.options.write().unwrap_or_else(|e| e.into_inner()) = Some(options.clone());
        let conn = engine::open(self.connector.as_ref(), &options).await?;
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = Some(conn);
        Ok(Value::Null)
    }

    async fn save(&self, content: &str) -> Result<Value, MleError> {
        if content.len() > MAX_SOURCE_LENGTH {
            return Err(MleError::InvalidRequest(format!(
                "source exceeds the maximum size of {MAX_SOURCE_LENGTH} bytes"
            )));
        }
        tokio::fs::write(&self.config.source_file, content)
            .await
            .map_err(|e| {
                tracing::error!("Writing {}: {}", self.config.source_file.display(), e);
                MleError::Operation("Error on saving contents to file".into())
            })?;
        Ok(Value::Null)
    }

    async fn deploy(&self) -> Result<Value, MleError> {
        let options = self.stored_options()?;
        let mut executor = DeploymentExecutor::new(Arc::clone(&self.connector), options);
        let (build, elapsed) = self
            .pipeline
            .pack(&self.config.pack_options(), &mut executor)
            .await?;
        let functions = build
            .descriptors
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>();
        Ok(json!({
            "functions": functions,
            "elapsedMs": elapsed.as_millis() as u64,
        }))
    }

    async fn get_schema_types(&self) -> Result<Value, MleError> {
        let conn = self.connection()?;
        let table = &self.config.generator.module_table;
        let sql = format!(
            "SELECT types FROM {table} WHERE module_id = (SELECT max(module_id) FROM {table} WHERE name = :name)"
        );
        let execution = conn
            .execute(&sql, &[BindValue::from(self.config.generator.source_name.as_str())])
            .await?;
        let text = match execution.scalar() {
            Some(Value::String(text)) => text.clone(),
            Some(_) => return Err(MleError::Operation("No types found".into())),
            None => return Err(MleError::Operation("Unable to retrieve types.".into())),
        };
        let descriptors = descriptors_from_json(&text)?;
        serde_json::to_value(descriptors).map_err(|e| MleError::Serialization(e.to_string()))
    }

    async fn get_table(&self, table: &str) -> Result<Value, MleError> {
        let context = |reason: String| {
            tracing::error!("{}", reason);
            MleError::Operation(format!("Failure while trying to read from table \"{table}\""))
        };
        if !IDENTIFIER.is_match(table) {
            return Err(context(format!("rejected table name {table:?}")));
        }
        let conn = self.connection()?;
        let execution = conn
            .execute(&format!("SELECT * FROM {table}"), &[])
            .await
            .map_err(|e| context(e.to_string()))?;
        Ok(RowMapper::new(execution.rows()).to_value())
    }

    async fn execute_statement(&self, sql: &str) -> Result<Value, MleError> {
        let conn = self.connection()?;
        let run = async {
            let execution = conn.execute(sql, &[]).await?;
            conn.commit().await?;
            Ok::<_, mlepack_core::EngineError>(execution)
        };
        let execution = run.await.map_err(|e| {
            tracing::error!("{}", e);
            MleError::Operation(format!("Failure while executing sql \"{sql}\": '{e}'"))
        })?;
        Ok(match execution.outcome {
            QueryOutcome::Rows(set) => RowMapper::new(set).to_value(),
            QueryOutcome::Affected(n) => Value::String(status_line(n)),
        })
    }

    async fn execute_function(
        &self,
        id: Value,
        name: &str,
        params: Vec<Value>,
    ) -> Result<Value, MleError> {
        let shown = params
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let context = |reason: String| {
            tracing::error!("{}", reason);
            MleError::Operation(format!(
                "Failure while executing function {name} with {shown}: {reason}"
            ))
        };

        if !IDENTIFIER.is_match(name) {
            return Err(context(format!("invalid function name {name:?}")));
        }
        let conn = self.connection()?;

        let placeholders = (0..params.len())
            .map(|i| format!(":in{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut binds = params
            .iter()
            .map(BindValue::from_json)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| context(e.to_string()))?;
        binds.push(BindValue::OutText);

        let execution = conn
            .execute(&format!("call {name}({placeholders}) INTO :outVar"), &binds)
            .await
            .map_err(|e| context(e.to_string()))?;
        let data = execution.out_binds.into_iter().next().unwrap_or(Value::Null);

        Ok(json!({
            "id": id,
            "func": name,
            "params": params,
            "data": data,
        }))
    }

    async fn execute_batch(&self, cases: &[BatchCase]) -> Result<Value, MleError> {
        let failed = |reason: String| {
            tracing::error!("{}", reason);
            MleError::Operation("Failure while testing multiple cases".into())
        };
        let conn = self.connection()?;

        let statements = cases
            .iter()
            .map(|case| {
                if !IDENTIFIER.is_match(&case.name) {
                    return Err(failed(format!("invalid function name {:?}", case.name)));
                }
                let args = case
                    .params
                    .iter()
                    .map(sql_literal)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| failed(e.to_string()))?;
                Ok(format!("SELECT {}({}) FROM dual", case.name, args.join(", ")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let results = join_all(statements.iter().map(|sql| conn.execute(sql, &[]))).await;

        cases
            .iter()
            .zip(results)
            .map(|(case, result)| {
                let execution = result.map_err(|e| failed(e.to_string()))?;
                let value = execution
                    .scalar()
                    .cloned()
                    .ok_or_else(|| failed("No rows available".into()))?;
                Ok(json!({ "id": case.id, "result": value }))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    async fn run_benchmark(&self) -> Result<Value, MleError> {
        let conn = self.connection()?;
        let averages = benchmark::run(conn.as_ref()).await.map_err(|e| {
            tracing::error!("{}", e);
            MleError::Operation("Failure while benchmarking".into())
        })?;
        Ok(json!(averages))
    }
}

/// Render a batch parameter as a SQL literal.
fn sql_literal(value: &Value) -> Result<String, MleError> {
    match value {
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok("NULL".into()),
        other => Err(MleError::InvalidRequest(format!(
            "parameter {other} is neither a string nor a number"
        ))),
    }
}
