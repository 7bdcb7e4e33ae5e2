//! # Artifact Generation
//!
//! Turns a bundle and its descriptor list into the three deployable statement
//! categories:
//!
//! 1. **Load**: a parameterized insert of `(name, types, source)` into the
//!    module table.
//! 2. **Register**: (re)creates the engine-resident source object from the
//!    newest module row for the target name. Only meaningful after Load has
//!    committed.
//! 3. **Wrappers**: one callable per descriptor forwarding to
//!    `source.function(args...)`.
//!
//! Every statement is assembled from typed pieces ([`CallSpec`], [`SqlScalar`])
//! so that quoting and escaping live in one place. Generation performs no I/O.

use crate::primitives::{
    DEFAULT_MODULE_TABLE, DEFAULT_OUTPUT_DIR, DEFAULT_SOURCE_NAME, LOADER_FILE, NAME_SEPARATOR,
    REGISTER_FILE, SOURCE_FILE,
};
use crate::{BindValue, FunctionDescriptor, MleError, Type, Warning, descriptors_to_json};
use std::collections::BTreeSet;
use std::path::PathBuf;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Generator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    /// Table receiving the load insert.
    pub module_table: String,
    /// Name of the engine-resident source object.
    pub source_name: String,
    /// Where emitted files go when `emit_files` is set.
    pub output_dir: PathBuf,
    pub emit_files: bool,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            module_table: DEFAULT_MODULE_TABLE.to_string(),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            emit_files: false,
        }
    }
}

// =============================================================================
// STATEMENTS
// =============================================================================

/// One executable statement and its bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub bindings: Vec<BindValue>,
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_bindings(sql: impl Into<String>, bindings: Vec<BindValue>) -> Self {
        Self {
            sql: sql.into(),
            bindings,
        }
    }
}

/// The wrapper statement created for one exported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperStatement {
    pub function: String,
    pub sql: String,
}

/// The three artifact categories of one pipeline run. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildArtifact {
    load: Statement,
    register: Statement,
    wrappers: Vec<WrapperStatement>,
    warnings: Vec<Warning>,
}

impl BuildArtifact {
    pub fn load(&self) -> &Statement {
        &self.load
    }

    pub fn register(&self) -> &Statement {
        &self.register
    }

    pub fn wrappers(&self) -> &[WrapperStatement] {
        &self.wrappers
    }

    /// Non-fatal findings collected during generation.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// File name and contents for each emitted artifact.
    #[must_use]
    pub fn files(&self) -> [(&'static str, String); 3] {
        let wrappers = self
            .wrappers
            .iter()
            .map(|w| w.sql.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        [
            (LOADER_FILE, self.load.sql.clone()),
            (SOURCE_FILE, self.register.sql.clone()),
            (REGISTER_FILE, wrappers),
        ]
    }
}

// =============================================================================
// TYPED BUILDER PIECES
// =============================================================================

/// Native scalar a wire type maps to, on both sides of the forwarding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlScalar {
    Number,
    Varchar2,
}

impl SqlScalar {
    /// Map a concrete wire type. `None` and unrecognised types have no scalar.
    #[must_use]
    pub fn for_type(ty: Type) -> Option<Self> {
        match ty {
            Type::Number => Some(SqlScalar::Number),
            Type::String => Some(SqlScalar::Varchar2),
            Type::None | Type::Unrecognized(_) => None,
        }
    }

    /// Engine-side type name.
    #[must_use]
    pub const fn sql_name(self) -> &'static str {
        match self {
            SqlScalar::Number => "NUMBER",
            SqlScalar::Varchar2 => "VARCHAR2",
        }
    }

    /// Script-side type name used in the forwarding signature.
    #[must_use]
    pub const fn script_name(self) -> &'static str {
        match self {
            SqlScalar::Number => "number",
            SqlScalar::Varchar2 => "string",
        }
    }
}

/// Function or procedure, with the return scalar for functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Function(SqlScalar),
    Procedure,
}

/// A validated wrapper definition, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    pub name: String,
    pub params: Vec<(String, SqlScalar)>,
    pub kind: CallKind,
}

impl CallSpec {
    /// Validate a descriptor's types and build its wrapper definition.
    pub fn from_descriptor(descriptor: &FunctionDescriptor) -> Result<Self, MleError> {
        let params = descriptor
            .parameters
            .iter()
            .map(|p| match p.ty {
                Type::None => Err(MleError::UntypeableParameter {
                    function: descriptor.name.clone(),
                    parameter: p.name.clone(),
                }),
                ty => SqlScalar::for_type(ty)
                    .map(|scalar| (p.name.clone(), scalar))
                    .ok_or_else(|| MleError::UnexpectedType {
                        function: descriptor.name.clone(),
                        ty,
                    }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let kind = match descriptor.return_type {
            Type::None => CallKind::Procedure,
            ty => CallKind::Function(SqlScalar::for_type(ty).ok_or_else(|| {
                MleError::UnexpectedType {
                    function: descriptor.name.clone(),
                    ty,
                }
            })?),
        };

        Ok(Self {
            name: descriptor.name.clone(),
            params,
            kind,
        })
    }

    /// Render the `CREATE OR REPLACE` statement forwarding to `source_name`.
    #[must_use]
    pub fn render(&self, source_name: &str) -> String {
        let sql_params = if self.params.is_empty() {
            String::new()
        } else {
            let list = self
                .params
                .iter()
                .map(|(name, scalar)| format!("{name} IN {}", scalar.sql_name()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({list})")
        };
        let script_params = self
            .params
            .iter()
            .map(|(name, scalar)| format!("{name} {}", scalar.script_name()))
            .collect::<Vec<_>>()
            .join(", ");
        let target = format!(
            "{}{NAME_SEPARATOR}{}",
            escape_source_name(source_name),
            self.name
        );

        match self.kind {
            CallKind::Procedure => format!(
                "CREATE OR REPLACE PROCEDURE {}{sql_params} AS LANGUAGE JAVASCRIPT NAME '{target}({script_params})';",
                self.name
            ),
            CallKind::Function(ret) => format!(
                "CREATE OR REPLACE FUNCTION {}{sql_params} RETURN {} AS LANGUAGE JAVASCRIPT NAME '{target}({script_params}) return {}';",
                self.name,
                ret.sql_name(),
                ret.script_name()
            ),
        }
    }
}

/// Escape every separator inside a source object name so the engine does not
/// read it as a member access.
#[must_use]
pub fn escape_source_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == NAME_SEPARATOR {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Double single quotes for embedding in a string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Double double quotes for embedding in a quoted identifier.
fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

// =============================================================================
// GENERATOR
// =============================================================================

/// Builds [`BuildArtifact`]s from a bundle and its descriptors.
#[derive(Debug, Clone, Default)]
pub struct ArtifactGenerator {
    config: GeneratorConfig,
}

impl ArtifactGenerator {
    #[must_use]
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Generate all three artifact categories.
    ///
    /// Every descriptor is validated before anything is returned, so a bad
    /// type aborts the whole call.
    pub fn generate(
        &self,
        bundle: &str,
        descriptors: &[FunctionDescriptor],
    ) -> Result<BuildArtifact, MleError> {
        let specs = descriptors
            .iter()
            .map(CallSpec::from_descriptor)
            .collect::<Result<Vec<_>, _>>()?;

        let wrappers = specs
            .iter()
            .map(|spec| WrapperStatement {
                function: spec.name.clone(),
                sql: spec.render(&self.config.source_name),
            })
            .collect();

        Ok(BuildArtifact {
            load: self.load_statement(bundle, descriptors)?,
            register: self.register_statement(),
            wrappers,
            warnings: duplicate_names(descriptors),
        })
    }

    fn load_statement(
        &self,
        bundle: &str,
        descriptors: &[FunctionDescriptor],
    ) -> Result<Statement, MleError> {
        let sql = format!(
            "INSERT INTO {} (name, types, source) VALUES (:name, :types, :src)",
            self.config.module_table
        );
        Ok(Statement::with_bindings(
            sql,
            vec![
                BindValue::from(self.config.source_name.as_str()),
                BindValue::Text(descriptors_to_json(descriptors)?),
                BindValue::from(bundle),
            ],
        ))
    }

    fn register_statement(&self) -> Statement {
        let table = &self.config.module_table;
        Statement::new(format!(
            "CREATE OR REPLACE JAVASCRIPT SOURCE NAMED {} USING CLOB SELECT source FROM {table} WHERE module_id = (SELECT max(module_id) FROM {table} WHERE name = {});",
            quote_identifier(&self.config.source_name),
            quote_literal(&self.config.source_name),
        ))
    }
}

fn duplicate_names(descriptors: &[FunctionDescriptor]) -> Vec<Warning> {
    let mut seen = BTreeSet::new();
    let mut reported = BTreeSet::new();
    descriptors
        .iter()
        .filter(|d| !seen.insert(d.name.as_str()) && reported.insert(d.name.as_str()))
        .map(|d| Warning::DuplicateDescriptor {
            name: d.name.clone(),
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================
