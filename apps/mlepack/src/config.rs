//! # Configuration
//!
//! Optional TOML file, `mlepack.toml` by default. Every field has a default,
//! and command-line flags override file values.
//!
//! ```toml
//! [module]
//! name = "mlemodules"      # source object name
//! table = "mlemodules"     # module table
//!
//! [connection]
//! connect_string = "localhost/XEPDB1"
//! user = "scott"
//! password = "tiger"
//!
//! [output]
//! dir = "./dist"
//! emit_files = false
//! emit_stats = false
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! source_file = "mle.ts"
//! ```

use crate::bundle::BundleOptions;
use crate::engine::ConnectionOptions;
use crate::session::SessionConfig;
use mlepack_core::primitives::{DEFAULT_MODULE_TABLE, DEFAULT_OUTPUT_DIR, DEFAULT_SOURCE_NAME};
use mlepack_core::{GeneratorConfig, MleError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File read when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "mlepack.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub module: ModuleConfig,
    pub connection: ConnectionConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub name: String,
    pub table: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SOURCE_NAME.to_string(),
            table: DEFAULT_MODULE_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_string: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub emit_files: bool,
    pub emit_stats: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            emit_files: false,
            emit_stats: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub source_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            source_file: PathBuf::from("mle.ts"),
        }
    }
}

impl Config {
    /// Load `path`, or `mlepack.toml` if present, or defaults.
    ///
    /// An explicitly named file must exist; the default file may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, MleError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No {} found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(MleError::Io(format!(
                    "Cannot read config {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, MleError> {
        toml::from_str(text).map_err(|e| MleError::Configuration(format!("Invalid config: {e}")))
    }

    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions::new(
            &self.connection.connect_string,
            &self.connection.user,
            &self.connection.password,
        )
    }

    #[must_use]
    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            module_table: self.module.table.clone(),
            source_name: self.module.name.clone(),
            output_dir: self.output.dir.clone(),
            emit_files: self.output.emit_files,
        }
    }

    #[must_use]
    pub fn bundle(&self, verbose: bool) -> BundleOptions {
        BundleOptions {
            name: self.module.name.clone(),
            verbose,
            emit_files: self.output.emit_files,
            emit_stats: self.output.emit_stats,
            output_dir: self.output.dir.clone(),
            ..BundleOptions::default()
        }
    }

    #[must_use]
    pub fn session(&self, verbose: bool) -> SessionConfig {
        SessionConfig {
            source_file: self.server.source_file.clone(),
            generator: self.generator(),
            bundle: self.bundle(verbose),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.module.table, "mlemodules");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.source_file, PathBuf::from("mle.ts"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [module]
            name = "app.v1"

            [output]
            emit_files = true
            "#,
        )
        .expect("parse");
        assert_eq!(config.module.name, "app.v1");
        assert_eq!(config.module.table, "mlemodules");
        assert!(config.output.emit_files);
        assert_eq!(config.output.dir, PathBuf::from("./dist"));

        let generator = config.generator();
        assert_eq!(generator.source_name, "app.v1");
        assert!(generator.emit_files);
        assert_eq!(config.bundle(false).name, "app.v1");
    }

    #[test]
    fn missing_explicit_file_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(MleError::Io(_))));
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        assert!(matches!(
            Config::parse("[server]\nport = \"eighty\""),
            Err(MleError::Configuration(_))
        ));
    }
}
