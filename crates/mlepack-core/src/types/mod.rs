//! # Core Type Definitions
//!
//! This module contains the data model shared by every stage of the pipeline:
//! - Wire types and function descriptors (`Type`, `Parameter`, `FunctionDescriptor`)
//! - Statement bindings (`BindValue`)
//! - Engine rejections (`EngineError`)
//! - Non-fatal findings (`Warning`)
//! - Error types (`MleError`)
//!
//! ## Descriptor Wire Format
//!
//! Descriptors are stored JSON-encoded in the module table's `types` column.
//! Types travel as small integers (`0 = String`, `1 = Number`, `2 = None`) so
//! that rows written by older deployments stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// WIRE TYPES
// =============================================================================

/// The wire-representable type of a parameter or return value.
///
/// `None` marks a procedure (no return value) and is never valid for a
/// parameter. `Unrecognized` only appears when a descriptor list is read back
/// from JSON carrying a code this build does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Type {
    String,
    Number,
    None,
    Unrecognized(u8),
}

impl Type {
    /// True for the two types a parameter may carry.
    #[must_use]
    pub const fn is_concrete(self) -> bool {
        matches!(self, Type::String | Type::Number)
    }
}

impl From<u8> for Type {
    fn from(code: u8) -> Self {
        match code {
            0 => Type::String,
            1 => Type::Number,
            2 => Type::None,
            other => Type::Unrecognized(other),
        }
    }
}

impl From<Type> for u8 {
    fn from(ty: Type) -> Self {
        match ty {
            Type::String => 0,
            Type::Number => 1,
            Type::None => 2,
            Type::Unrecognized(code) => code,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::String => write!(f, "string"),
            Type::Number => write!(f, "number"),
            Type::None => write!(f, "none"),
            Type::Unrecognized(code) => write!(f, "unrecognized({code})"),
        }
    }
}

// =============================================================================
// FUNCTION DESCRIPTOR
// =============================================================================

/// One named, typed parameter of an exported function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// The extracted signature of one exported function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub return_type: Type,
}

impl FunctionDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, parameters: Vec<Parameter>, return_type: Type) -> Self {
        Self {
            name: name.into(),
            parameters,
            return_type,
        }
    }

    /// A descriptor without a return value is deployed as a procedure.
    #[must_use]
    pub fn is_procedure(&self) -> bool {
        self.return_type == Type::None
    }
}

/// Encode a descriptor list as the module table's `types` column.
pub fn descriptors_to_json(descriptors: &[FunctionDescriptor]) -> Result<String, MleError> {
    serde_json::to_string(descriptors).map_err(|e| MleError::Serialization(e.to_string()))
}

/// Decode the module table's `types` column.
pub fn descriptors_from_json(text: &str) -> Result<Vec<FunctionDescriptor>, MleError> {
    serde_json::from_str(text).map_err(|e| MleError::Serialization(e.to_string()))
}

// =============================================================================
// BINDINGS
// =============================================================================

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Number(serde_json::Number),
    Null,
    /// An output slot the engine fills with text (e.g. `INTO :outVar`).
    OutText,
}

impl BindValue {
    /// Convert an incoming JSON parameter. Only strings and numbers are bindable.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, MleError> {
        match value {
            serde_json::Value::String(s) => Ok(BindValue::Text(s.clone())),
            serde_json::Value::Number(n) => Ok(BindValue::Number(n.clone())),
            serde_json::Value::Null => Ok(BindValue::Null),
            other => Err(MleError::InvalidRequest(format!(
                "parameter {other} is neither a string nor a number"
            ))),
        }
    }

    /// The JSON view of an input binding. Output slots have none.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BindValue::Text(s) => serde_json::Value::String(s.clone()),
            BindValue::Number(n) => serde_json::Value::Number(n.clone()),
            BindValue::Null | BindValue::OutText => serde_json::Value::Null,
        }
    }
}

impl From<&str> for BindValue {
    fn from(s: &str) -> Self {
        BindValue::Text(s.to_string())
    }
}

impl From<String> for BindValue {
    fn from(s: String) -> Self {
        BindValue::Text(s)
    }
}

impl From<i64> for BindValue {
    fn from(n: i64) -> Self {
        BindValue::Number(n.into())
    }
}

// =============================================================================
// ENGINE ERRORS
// =============================================================================

/// A statement rejected by the engine, with its native code and error offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: Option<i32>,
    pub message: String,
    pub offset: Option<usize>,
}

impl EngineError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            offset: None,
        }
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// An error without a native code (transport failures and the like).
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            offset: None,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{code}: ")?;
        }
        write!(f, "{}", self.message)?;
        match self.offset {
            Some(offset) if offset > 0 => write!(f, " at position {offset}."),
            _ => write!(f, "."),
        }
    }
}

impl std::error::Error for EngineError {}

// =============================================================================
// WARNINGS
// =============================================================================

/// Non-fatal findings. The core has no logger; callers decide how to report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A return type outside the three recognised classifications.
    UnclassifiedReturn { function: String, static_type: String },
    /// Two descriptors in one batch share a name; the later wrapper replaces the earlier.
    DuplicateDescriptor { name: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnclassifiedReturn {
                function,
                static_type,
            } => write!(
                f,
                "Unable to identify type {static_type} of {function} as one of the db suitable types. Assuming none"
            ),
            Warning::DuplicateDescriptor { name } => {
                write!(f, "Function {name} is exported more than once; the last wrapper wins")
            }
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur while building, deploying or querying modules.
#[derive(Debug, Error)]
pub enum MleError {
    /// Bad connection parameters, or the engine refused the connection.
    #[error("Failure while creating a database connection: {0}")]
    Configuration(String),

    /// A parameter whose type cannot be represented on the wire.
    #[error("None cannot be the type of parameter {parameter} of function {function}")]
    UntypeableParameter { function: String, parameter: String },

    /// A descriptor type outside the recognised classifications reached generation.
    #[error("Unexpected type {ty} in function {function}")]
    UnexpectedType { function: String, ty: Type },

    /// The type-resolution collaborator could not produce a signature.
    #[error("Type resolution failed: {0}")]
    Resolve(String),

    /// The engine rejected a statement.
    #[error("{0}")]
    Engine(#[from] EngineError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An operation needed a connection the session does not hold.
    #[error("No database connection; configure the session first")]
    NotConnected,

    /// The bundler's graph resolution failed.
    #[error("Bundling failed: {0}")]
    Bundle(String),

    /// A malformed request reached an operation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A deployed module function failed while running.
    #[error("Script error: {0}")]
    Script(String),

    /// An operation failed; the message carries what was being attempted.
    #[error("{0}")]
    Operation(String),
}

// =============================================================================
// TESTS
// =============================================================================
