//! # Session Wire Types
//!
//! JSON messages exchanged over the session WebSocket.

use crate::engine::ConnectionOptions;
use crate::session::{BatchCase, GateOutcome, Operation};
use mlepack_core::GateState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// CLIENT MESSAGES
// =============================================================================

/// A message from the client, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Configure(ConnectionOptions),
    Save {
        file: String,
    },
    Deploy,
    GetSchemaTypes,
    GetTable {
        table: String,
    },
    ExecuteStatement {
        sql: String,
    },
    ExecuteFunction {
        #[serde(default)]
        id: Value,
        func: String,
        #[serde(default)]
        params: Vec<Value>,
    },
    ExecuteBatch {
        tests: Vec<BatchCaseJson>,
    },
    RunBenchmark,
    State,
}

/// One batch case as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCaseJson {
    #[serde(default)]
    pub id: Value,
    pub func: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl ClientMessage {
    /// The gated operation this message requests. `None` for `state`.
    #[must_use]
    pub fn into_operation(self) -> Option<Operation> {
        Some(match self {
            ClientMessage::Configure(options) => Operation::Configure(options),
            ClientMessage::Save { file } => Operation::Save(file),
            ClientMessage::Deploy => Operation::Deploy,
            ClientMessage::GetSchemaTypes => Operation::GetSchemaTypes,
            ClientMessage::GetTable { table } => Operation::GetTable(table),
            ClientMessage::ExecuteStatement { sql } => Operation::ExecuteStatement(sql),
            ClientMessage::ExecuteFunction { id, func, params } => Operation::ExecuteFunction {
                id,
                name: func,
                params,
            },
            ClientMessage::ExecuteBatch { tests } => Operation::ExecuteBatch(
                tests
                    .into_iter()
                    .map(|t| BatchCase {
                        id: t.id,
                        name: t.func,
                        params: t.params,
                    })
                    .collect(),
            ),
            ClientMessage::RunBenchmark => Operation::RunBenchmark,
            ClientMessage::State => return None,
        })
    }
}

// =============================================================================
// SERVER EVENTS
// =============================================================================

/// An event sent to the client, tagged by `"event"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    Result { status: String, data: Value },
    Failure { message: String },
    Busy,
    State { state: GateState },
}

impl From<GateOutcome> for ServerEvent {
    fn from(outcome: GateOutcome) -> Self {
        match outcome {
            GateOutcome::Busy => ServerEvent::Busy,
            GateOutcome::Success { status, data } => ServerEvent::Result { status, data },
            GateOutcome::Failure(message) => ServerEvent::Failure { message },
        }
    }
}
