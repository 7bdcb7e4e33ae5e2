//! # mlepack-core
//!
//! The deterministic pipeline logic for mlepack - THE LOGIC.
//!
//! Turns a script module into deployable engine statements and provides the
//! runtime layer deployed code uses to query data back:
//!
//! - `scan` + `signature`: module source to ordered function descriptors
//! - `transpile`: type-syntax erasure for bundled module bodies
//! - `artifact`: descriptors + bundle to load, register and wrapper statements
//! - `gate`: the per-session single-flight state machine
//! - `runtime`: select rewriting, schema cache, lazy row mapping, dispatch and
//!   the module script evaluator that fills it
//!
//! ## Architectural Constraints
//!
//! - Has NO async, NO network dependencies (pure Rust)
//! - Performs no I/O; file emission and statement execution belong to the app
//! - Does not log; non-fatal findings are returned as [`Warning`] values

// =============================================================================
// MODULES
// =============================================================================

pub mod artifact;
pub mod gate;
pub mod primitives;
pub mod runtime;
pub mod scan;
pub mod signature;
pub mod transpile;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    BindValue, EngineError, FunctionDescriptor, MleError, Parameter, Type, Warning,
    descriptors_from_json, descriptors_to_json,
};

// =============================================================================
// RE-EXPORTS: Pipeline
// =============================================================================

pub use artifact::{
    ArtifactGenerator, BuildArtifact, CallKind, CallSpec, GeneratorConfig, SqlScalar, Statement,
    WrapperStatement, escape_source_name,
};
pub use gate::{GateEvent, GateState, transition};
pub use scan::parse_module;
pub use transpile::strip_types;
pub use signature::{
    AnnotationResolver, Expr, Extraction, FunctionNode, Item, Module, ParamNode,
    SignatureExtractor, StaticSignature, TypeResolver, wire_type,
};

// =============================================================================
// RE-EXPORTS: Runtime
// =============================================================================

pub use runtime::{
    ColumnInfo, Dispatcher, QueryOutcome, QueryResult, Record, RowMapper, RowSet, SchemaCache,
    Script, SqlConnection, SqlRuntime, Template, status_line,
};
