//! # Bundler
//!
//! Turns an entry module into one self-contained artifact string in a
//! universal module format.
//!
//! Graph resolution is delegated to a [`GraphResolver`]. Before it runs, an
//! ordered list of [`Middleware`] may rewrite the entry path and options. A
//! failing middleware is logged and flags the run as failed, but bundling
//! continues with the values from before that step.
//!
//! [`LocalResolver`] is the built-in resolver: it follows relative and
//! `node_modules` imports from the entry, erases type syntax from every
//! module, concatenates them dependencies-first and exposes the entry's
//! exports through a UMD wrapper.

use async_trait::async_trait;
use mlepack_core::primitives::{BUNDLE_SUFFIX, DEFAULT_OUTPUT_DIR};
use mlepack_core::{Item, MleError, parse_module, strip_types};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

/// Bundle name used when none is configured.
pub const DEFAULT_BUNDLE_NAME: &str = "DBApp";

static IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s+(?:[^'";]*?\s+from\s+)?['"]([^'"]+)['"][ \t]*;?[ \t]*\r?$"#)
        .expect("import pattern")
});

static REEXPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*export\s+(?:\*|\{[^}]*\})\s+from\s+['"]([^'"]+)['"][ \t]*;?[ \t]*\r?$"#)
        .expect("re-export pattern")
});

static EXPORT_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*export\s*\{([^}]*)\}[ \t]*;?[ \t]*\r?$").expect("export list pattern")
});

static EXPORT_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^([ \t]*)export\s+(?:default\s+)?((?:async\s+)?function\b|const\b|let\b|var\b|class\b|namespace\b|module\b|enum\b)",
    )
    .expect("export keyword pattern")
});

// =============================================================================
// OPTIONS
// =============================================================================

/// Bundler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleOptions {
    /// Target name: the UMD global and the emitted file stem.
    pub name: String,
    pub verbose: bool,
    pub emit_files: bool,
    pub emit_stats: bool,
    pub output_dir: PathBuf,
    /// Options passed through untouched to the resolver.
    pub lower: Map<String, Value>,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_BUNDLE_NAME.to_string(),
            verbose: false,
            emit_files: false,
            emit_stats: false,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            lower: Map::new(),
        }
    }
}

// =============================================================================
// COLLABORATOR SEAMS
// =============================================================================

/// One output unit of a resolved graph. Assets contribute no code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleUnit {
    Chunk { file_name: String, code: String },
    Asset { file_name: String },
}

/// A resolved dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleGraph {
    pub units: Vec<BundleUnit>,
    /// Every source file that went into the graph.
    pub files: Vec<PathBuf>,
}

/// Resolves an entry module's full dependency graph.
#[async_trait]
pub trait GraphResolver: Send + Sync {
    async fn resolve(&self, entry: &Path, options: &BundleOptions) -> Result<ModuleGraph, MleError>;
}

/// A pre-bundle transform of `(entry, options)`.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        entry: PathBuf,
        options: BundleOptions,
    ) -> Result<(PathBuf, BundleOptions), MleError>;
}

// =============================================================================
// BUNDLER
// =============================================================================

/// What one bundle call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleOutput {
    pub code: String,
    pub chunks: usize,
    pub files: usize,
    pub elapsed: Duration,
    /// Set when any middleware failed.
    pub failed: bool,
    /// Path of the emitted bundle file, when emission is enabled.
    pub written: Option<PathBuf>,
}

pub struct Bundler {
    entry: PathBuf,
    options: BundleOptions,
    middleware: Vec<Arc<dyn Middleware>>,
    resolver: Arc<dyn GraphResolver>,
}

impl Bundler {
    #[must_use]
    pub fn new(
        entry: impl Into<PathBuf>,
        options: BundleOptions,
        resolver: Arc<dyn GraphResolver>,
    ) -> Self {
        Self {
            entry: entry.into(),
            options,
            middleware: Vec::new(),
            resolver,
        }
    }

    /// Append a middleware. Middleware runs in registration order.
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Run middleware, resolve the graph and join its chunks.
    pub async fn bundle(mut self) -> Result<BundleOutput, MleError> {
        let started = Instant::now();
        let mut failed = false;

        for (position, middleware) in self.middleware.iter().enumerate() {
            match middleware
                .apply(self.entry.clone(), self.options.clone())
                .await
            {
                Ok((entry, options)) => {
                    self.entry = entry;
                    self.options = options;
                }
                Err(e) => {
                    failed = true;
                    tracing::error!(
                        "Error while calling custom middleware {} at position {}: {}",
                        middleware.name(),
                        position,
                        e
                    );
                }
            }
        }

        tracing::debug!("Resolving module graph from {}", self.entry.display());
        let graph = self.resolver.resolve(&self.entry, &self.options).await?;

        let code = graph
            .units
            .iter()
            .map(|unit| match unit {
                BundleUnit::Chunk { code, .. } => code.as_str(),
                BundleUnit::Asset { .. } => "",
            })
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = graph
            .units
            .iter()
            .filter(|u| matches!(u, BundleUnit::Chunk { .. }))
            .count();

        let written = if self.options.emit_files {
            let path = self
                .options
                .output_dir
                .join(format!("{}{BUNDLE_SUFFIX}", self.options.name));
            tokio::fs::create_dir_all(&self.options.output_dir)
                .await
                .map_err(|e| MleError::Io(format!("Failure while creating {}: {e}", self.options.output_dir.display())))?;
            tokio::fs::write(&path, &code)
                .await
                .map_err(|e| MleError::Io(format!("Failure while writing {}: {e}", path.display())))?;
            tracing::debug!("Wrote bundle to {}", path.display());
            Some(path)
        } else {
            None
        };

        let elapsed = started.elapsed();
        if self.options.emit_stats {
            tracing::info!("Bundling finished in {:?}", elapsed);
            tracing::info!("{}", stats_line(chunks, graph.files.len()));
        }

        Ok(BundleOutput {
            code,
            chunks,
            files: graph.files.len(),
            elapsed,
            failed,
            written,
        })
    }
}

/// `"Generated 1 chunk from 3 files"`.
#[must_use]
pub fn stats_line(chunks: usize, files: usize) -> String {
    let plural = |n: usize| if n == 1 { "" } else { "s" };
    format!(
        "Generated {chunks} chunk{} from {files} file{}",
        plural(chunks),
        plural(files)
    )
}

// =============================================================================
// LOCAL RESOLVER
// =============================================================================

/// Follows imports on the local filesystem and wraps the result as UMD.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalResolver;

#[async_trait]
impl GraphResolver for LocalResolver {
    async fn resolve(&self, entry: &Path, options: &BundleOptions) -> Result<ModuleGraph, MleError> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        visit(entry.to_path_buf(), &mut visited, &mut order).await?;

        let entry_source = order
            .last()
            .map(|(_, src)| src.as_str())
            .unwrap_or_default();
        let exports = exported_names(entry_source)?;

        let bodies = order
            .iter()
            .map(|(_, src)| strip_types(src).map(|plain| strip_module_syntax(&plain)))
            .collect::<Result<Vec<_>, _>>()?
            .join("\n");

        let code = umd(&options.name, &bodies, &exports);
        Ok(ModuleGraph {
            units: vec![BundleUnit::Chunk {
                file_name: format!("{}{BUNDLE_SUFFIX}", options.name),
                code,
            }],
            files: order.into_iter().map(|(path, _)| path).collect(),
        })
    }
}

/// Depth-first, dependencies before dependents.
async fn visit(
    path: PathBuf,
    visited: &mut BTreeSet<PathBuf>,
    order: &mut Vec<(PathBuf, String)>,
) -> Result<(), MleError> {
    let mut stack = vec![(path, false)];
    while let Some((path, expanded)) = stack.pop() {
        if expanded {
            let src = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| MleError::Bundle(format!("Could not read {}: {e}", path.display())))?;
            order.push((path, src));
            continue;
        }
        if !visited.insert(path.clone()) {
            continue;
        }

        let src = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MleError::Bundle(format!("Could not read {}: {e}", path.display())))?;
        stack.push((path.clone(), true));

        let specifiers = IMPORT
            .captures_iter(&src)
            .chain(REEXPORT.captures_iter(&src))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect::<Vec<_>>();
        for spec in specifiers.into_iter().rev() {
            let dep = resolve_specifier(&path, &spec).await?;
            if !visited.contains(&dep) {
                stack.push((dep, false));
            }
        }
    }
    Ok(())
}

async fn resolve_specifier(from: &Path, spec: &str) -> Result<PathBuf, MleError> {
    let dir = from.parent().unwrap_or_else(|| Path::new("."));
    let candidates: Vec<PathBuf> = if spec.starts_with("./") || spec.starts_with("../") {
        let base = dir.join(spec);
        vec![
            base.clone(),
            base.with_extension("ts"),
            base.with_extension("js"),
            base.join("index.ts"),
            base.join("index.js"),
        ]
    } else {
        dir.ancestors()
            .flat_map(|a| {
                let base = a.join("node_modules").join(spec);
                [base.with_extension("js"), base.join("index.js")]
            })
            .collect()
    };

    for candidate in candidates {
        if tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            return Ok(candidate);
        }
    }
    Err(MleError::Bundle(format!(
        "Could not resolve '{spec}' from {}",
        from.display()
    )))
}

fn exported_names(src: &str) -> Result<Vec<String>, MleError> {
    let module = parse_module(src)?;
    let mut names = module
        .items
        .iter()
        .filter(|item| item.is_exported())
        .filter_map(|item| match item {
            Item::Function { function, .. } => function.name.clone(),
            Item::Binding { name, .. } | Item::Block { name, .. } => Some(name.clone()),
        })
        .collect::<Vec<_>>();

    for caps in EXPORT_LIST.captures_iter(src) {
        for entry in caps[1].split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let exposed = entry.rsplit(" as ").next().unwrap_or(entry).trim();
            names.push(exposed.to_string());
        }
    }
    Ok(names)
}

fn strip_module_syntax(src: &str) -> String {
    let without_imports = IMPORT.replace_all(src, "");
    let without_reexports = REEXPORT.replace_all(&without_imports, "");
    let without_lists = EXPORT_LIST.replace_all(&without_reexports, "");
    EXPORT_KEYWORD
        .replace_all(&without_lists, "$1$2")
        .trim()
        .to_string()
}

fn umd(name: &str, body: &str, exports: &[String]) -> String {
    let assignments = exports
        .iter()
        .map(|e| format!("exports.{e} = {e};"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "(function (global, factory) {{\n\
         \ttypeof exports === 'object' && typeof module !== 'undefined' ? factory(exports) :\n\
         \ttypeof define === 'function' && define.amd ? define(['exports'], factory) :\n\
         \t(global = global || self, factory(global.{name} = {{}}));\n\
         }}(this, function (exports) {{ 'use strict';\n\n\
         {body}\n\n\
         {assignments}\n\n\
         Object.defineProperty(exports, '__esModule', {{ value: true }});\n\n\
         }}));\n"
    )
}

// =============================================================================
// TESTS
// =============================================================================
