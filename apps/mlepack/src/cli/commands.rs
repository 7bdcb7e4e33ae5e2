//! # CLI Command Implementations

use crate::api::{self, AppState};
use crate::bundle::LocalResolver;
use crate::config::Config;
use crate::deploy::{DeploymentExecutor, PackOptions, Pipeline};
use crate::engine::{SandboxConnector, SandboxEngine};
use mlepack_core::{MleError, SchemaCache};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Canonicalize an input path and make sure it is a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, MleError> {
    let canonical = path.canonicalize().map_err(|e| {
        MleError::Io(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(MleError::Io(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// The in-process engine with the configured module table in place.
///
/// When a user is configured, only that account may connect.
pub fn sandbox_connector(config: &Config) -> Result<Arc<SandboxConnector>, MleError> {
    let engine = Arc::new(SandboxEngine::new(Arc::new(SchemaCache::default())));
    engine.create_module_table(&config.module.table)?;

    let connector = SandboxConnector::new(engine);
    let connector = if config.connection.user.is_empty() {
        connector
    } else {
        connector.with_account(&config.connection.user, &config.connection.password)
    };
    Ok(Arc::new(connector))
}

fn pack_options(config: &Config, entry: PathBuf, verbose: bool) -> PackOptions {
    PackOptions {
        entry,
        generator: config.generator(),
        bundle: config.bundle(verbose),
    }
}

// =============================================================================
// PACK COMMAND
// =============================================================================

/// Build and deploy one module.
pub async fn cmd_pack(config: &Config, file: &Path, verbose: bool) -> Result<(), MleError> {
    let entry = validate_file_path(file)?;
    let connector = sandbox_connector(config)?;
    let mut executor = DeploymentExecutor::new(connector, config.connection_options());

    let pipeline = Pipeline::new(Arc::new(LocalResolver));
    let (build, elapsed) = pipeline
        .pack(&pack_options(config, entry, verbose), &mut executor)
        .await?;

    println!("Deployed {} as {}", file.display(), config.module.name);
    for descriptor in &build.descriptors {
        let kind = if descriptor.is_procedure() {
            "procedure"
        } else {
            "function"
        };
        println!("  {:<9} {}", kind, descriptor.name);
    }
    println!("Finished in {:?}", elapsed);
    Ok(())
}

// =============================================================================
// INSPECT COMMAND
// =============================================================================

/// Print descriptors and statements without connecting or writing files.
pub async fn cmd_inspect(config: &Config, file: &Path, json_mode: bool) -> Result<(), MleError> {
    let entry = validate_file_path(file)?;
    let mut options = pack_options(config, entry, false);
    options.generator.emit_files = false;
    options.bundle.emit_files = false;

    let build = Pipeline::new(Arc::new(LocalResolver)).build(&options).await?;
    let artifact = &build.artifact;

    if json_mode {
        let output = serde_json::json!({
            "descriptors": build.descriptors,
            "load": artifact.load().sql,
            "register": artifact.register().sql,
            "wrappers": artifact.wrappers().iter().map(|w| &w.sql).collect::<Vec<_>>(),
            "warnings": artifact.warnings().iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Descriptors");
    println!("===========");
    for d in &build.descriptors {
        let params = d
            .parameters
            .iter()
            .map(|p| format!("{}: {:?}", p.name, p.ty))
            .collect::<Vec<_>>()
            .join(", ");
        println!("{}({}) -> {:?}", d.name, params, d.return_type);
    }
    println!();
    println!("Load:     {}", artifact.load().sql);
    println!("Register: {}", artifact.register().sql);
    println!("Wrappers:");
    for w in artifact.wrappers() {
        println!("  {}", w.sql);
    }
    for warning in artifact.warnings() {
        println!("warning: {}", warning);
    }
    Ok(())
}

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Start the session server.
pub async fn cmd_serve(config: &Config, verbose: bool) -> Result<(), MleError> {
    let connector = sandbox_connector(config)?;
    let state = AppState::new(
        connector,
        Pipeline::new(Arc::new(LocalResolver)),
        config.session(verbose),
    );

    println!("mlepack session server starting...");
    println!();
    println!("Configuration:");
    println!("  Host:        {}", config.server.host);
    println!("  Port:        {}", config.server.port);
    println!("  Source file: {}", config.server.source_file.display());
    println!("  Module:      {} (table {})", config.module.name, config.module.table);
    println!();
    println!("Endpoints:");
    println!("  GET /health  - Health check");
    println!("  GET /session - WebSocket session");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    api::run_server(&addr, state).await
}
