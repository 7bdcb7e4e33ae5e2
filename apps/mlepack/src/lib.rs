//! # mlepack
//!
//! The async half of mlepack - THE BINARY.
//!
//! - `engine`: connection traits and the in-process sandbox engine
//! - `bundle`: the bundler contract, middleware and the local resolver
//! - `emit`: artifact file emission
//! - `deploy`: the deployment executor and the pack pipeline
//! - `session`: gated per-client sessions
//! - `api`: the axum session server
//! - `cli` + `config`: command line and TOML configuration
//!
//! All pipeline logic that needs no I/O lives in `mlepack-core`.

// =============================================================================
// MODULES
// =============================================================================

pub mod api;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod emit;
pub mod engine;
pub mod session;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use bundle::{BundleOptions, BundleOutput, Bundler, GraphResolver, LocalResolver, Middleware};
pub use config::Config;
pub use deploy::{Build, DeploymentExecutor, PackOptions, Pipeline};
pub use engine::{Connection, ConnectionOptions, Connector, Execution, SandboxConnector, SandboxEngine};
pub use session::{GateOutcome, Operation, Session, SessionConfig};
