//! # Engine Connections
//!
//! The async seam between the pipeline and the execution engine.
//!
//! - [`Connector`] opens connections from [`ConnectionOptions`]
//! - [`Connection`] executes one statement at a time and commits
//!
//! The network driver for a production engine lives outside this crate; the
//! in-process [`sandbox`] engine implements both traits.

pub mod sandbox;

pub use sandbox::{SandboxConnector, SandboxEngine};

use async_trait::async_trait;
use mlepack_core::{BindValue, EngineError, MleError, QueryOutcome, RowSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// CONNECTION OPTIONS
// =============================================================================

/// Credentials and target of a connection.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    #[serde(default)]
    pub connect_string: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(
        connect_string: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            connect_string: connect_string.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("connect_string", &self.connect_string)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

// =============================================================================
// EXECUTION RESULTS
// =============================================================================

/// Result of one executed statement: rows or an affected count, plus the
/// values of any output binds in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outcome: QueryOutcome,
    pub out_binds: Vec<Value>,
}

impl Execution {
    #[must_use]
    pub fn new(outcome: QueryOutcome) -> Self {
        Self {
            outcome,
            out_binds: Vec::new(),
        }
    }

    /// The row set, or an empty one for affected-row results.
    #[must_use]
    pub fn rows(&self) -> RowSet {
        match &self.outcome {
            QueryOutcome::Rows(set) => set.clone(),
            QueryOutcome::Affected(_) => RowSet::default(),
        }
    }

    /// First column of the first row.
    #[must_use]
    pub fn scalar(&self) -> Option<&Value> {
        match &self.outcome {
            QueryOutcome::Rows(set) => set.rows.first().and_then(|row| row.first()),
            QueryOutcome::Affected(_) => None,
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// An open connection to the engine.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn execute(&self, sql: &str, binds: &[BindValue]) -> Result<Execution, EngineError>;

    async fn commit(&self) -> Result<(), EngineError>;
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Connection>, EngineError>;
}

/// Open a connection, wrapping any failure as a configuration error.
pub async fn open(
    connector: &dyn Connector,
    options: &ConnectionOptions,
) -> Result<Arc<dyn Connection>, MleError> {
    connector.connect(options).await.map_err(|e| {
        tracing::error!("Connecting to {} failed: {}", options.connect_string, e);
        MleError::Configuration(e.to_string())
    })
}
