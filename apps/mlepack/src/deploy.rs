//! # Deployment
//!
//! [`DeploymentExecutor`] holds one engine connection and runs artifact
//! statements against it. [`Pipeline`] drives a whole pack run:
//!
//! ```text
//! read source -> scan -> extract -> bundle -> generate -> (emit) -> deploy
//! ```
//!
//! Deployment order is fixed: load, then register, then every wrapper at
//! once. A failing load or register aborts the run. Wrapper failures are
//! logged one by one and reported together once all wrappers have settled.

use crate::bundle::{BundleOptions, BundleOutput, Bundler, GraphResolver, Middleware};
use crate::emit::emit_artifact;
use crate::engine::{self, Connection, ConnectionOptions, Connector, Execution};
use futures::future::join_all;
use mlepack_core::primitives::MAX_SOURCE_LENGTH;
use mlepack_core::{
    AnnotationResolver, ArtifactGenerator, BuildArtifact, FunctionDescriptor, GeneratorConfig,
    MleError, SignatureExtractor, Statement, parse_module,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// EXECUTOR
// =============================================================================

pub struct DeploymentExecutor {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    conn: Option<Arc<dyn Connection>>,
}

impl DeploymentExecutor {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        Self {
            connector,
            options,
            conn: None,
        }
    }

    /// Open the executor's single connection. Calling it again reconnects.
    pub async fn init(&mut self) -> Result<(), MleError> {
        let conn = engine::open(self.connector.as_ref(), &self.options).await?;
        self.conn = Some(conn);
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Run one statement and commit it.
    pub async fn execute(&self, statement: &Statement) -> Result<Execution, MleError> {
        let conn = self.conn.as_ref().ok_or(MleError::NotConnected)?;
        let execution = conn.execute(&statement.sql, &statement.bindings).await?;
        conn.commit().await?;
        Ok(execution)
    }

    /// Deploy an artifact. Returns the number of wrappers created.
    pub async fn deploy(&self, artifact: &BuildArtifact) -> Result<usize, MleError> {
        tracing::debug!("Executing load statement");
        self.execute(artifact.load()).await?;

        tracing::debug!("Executing register statement");
        self.execute(artifact.register()).await?;

        tracing::debug!("Executing {} wrapper statements", artifact.wrappers().len());
        let results = join_all(
            artifact
                .wrappers()
                .iter()
                .map(|w| async move { (w, self.execute(&Statement::new(w.sql.clone())).await) }),
        )
        .await;

        let failed = results
            .iter()
            .filter_map(|(wrapper, result)| {
                let e = result.as_ref().err()?;
                tracing::error!("Failure while creating wrapper {}: {}", wrapper.function, e);
                Some(wrapper.function.as_str())
            })
            .collect::<Vec<_>>();

        if failed.is_empty() {
            Ok(results.len())
        } else {
            Err(MleError::Operation(format!(
                "{} of {} wrapper statements failed: {}",
                failed.len(),
                results.len(),
                failed.join(", ")
            )))
        }
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Settings for one pack run.
#[derive(Debug, Clone)]
pub struct PackOptions {
    pub entry: PathBuf,
    pub generator: GeneratorConfig,
    pub bundle: BundleOptions,
}

/// Everything a build produced before deployment.
#[derive(Debug, Clone)]
pub struct Build {
    pub descriptors: Vec<FunctionDescriptor>,
    pub bundle: BundleOutput,
    pub artifact: BuildArtifact,
}

/// Bundling collaborators shared by every run.
pub struct Pipeline {
    resolver: Arc<dyn GraphResolver>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(resolver: Arc<dyn GraphResolver>) -> Self {
        Self {
            resolver,
            middleware: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Extract, bundle and generate without touching the engine.
    pub async fn build(&self, options: &PackOptions) -> Result<Build, MleError> {
        let source = read_source(&options.entry).await?;

        tracing::debug!("Extracting signatures from {}", options.entry.display());
        let module = parse_module(&source)?;
        let extraction = SignatureExtractor::new(AnnotationResolver).extract(&module)?;
        for warning in &extraction.warnings {
            tracing::warn!("{}", warning);
        }

        let bundler = self.middleware.iter().fold(
            Bundler::new(&options.entry, options.bundle.clone(), Arc::clone(&self.resolver)),
            |bundler, m| bundler.with_middleware(Arc::clone(m)),
        );
        let bundle = bundler.bundle().await?;
        if bundle.failed {
            tracing::warn!("Bundling completed with middleware failures");
        }

        tracing::debug!("Generating load statement");
        tracing::debug!("Generating register statement");
        tracing::debug!("Generating {} wrapper statements", extraction.descriptors.len());
        let generator = ArtifactGenerator::new(options.generator.clone());
        let artifact = generator.generate(&bundle.code, &extraction.descriptors)?;
        for warning in artifact.warnings() {
            tracing::warn!("{}", warning);
        }

        if generator.config().emit_files {
            emit_artifact(&artifact, &generator.config().output_dir).await?;
        }

        Ok(Build {
            descriptors: extraction.descriptors,
            bundle,
            artifact,
        })
    }

    /// Build, then deploy through `executor`, connecting it first if needed.
    pub async fn pack(
        &self,
        options: &PackOptions,
        executor: &mut DeploymentExecutor,
    ) -> Result<(Build, Duration), MleError> {
        let started = Instant::now();
        let build = self.build(options).await?;

        if !executor.is_connected() {
            executor.init().await?;
        }
        executor.deploy(&build.artifact).await?;

        let elapsed = started.elapsed();
        tracing::info!(
            "Finished uploading {} in {:?}",
            options.entry.display(),
            elapsed
        );
        Ok((build, elapsed))
    }
}

async fn read_source(path: &Path) -> Result<String, MleError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| MleError::Io(format!("Cannot read {}: {e}", path.display())))?;
    if metadata.len() > MAX_SOURCE_LENGTH as u64 {
        return Err(MleError::InvalidRequest(format!(
            "{} exceeds the maximum source size of {MAX_SOURCE_LENGTH} bytes",
            path.display()
        )));
    }
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MleError::Io(format!("Cannot read {}: {e}", path.display())))
}
