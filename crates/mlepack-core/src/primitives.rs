//! # Primitives
//!
//! Fixed names and limits shared by the pipeline and the runtime layer.

/// Default module table holding uploaded bundles and their descriptors.
pub const DEFAULT_MODULE_TABLE: &str = "mlemodules";

/// Default name of the engine-resident source object.
pub const DEFAULT_SOURCE_NAME: &str = "mlemodules";

/// Default directory for emitted artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "./dist";

/// Emitted load statement.
pub const LOADER_FILE: &str = "loader.sql";

/// Emitted register statement.
pub const SOURCE_FILE: &str = "source.sql";

/// Emitted wrapper statements, one per line.
pub const REGISTER_FILE: &str = "register.sql";

/// Suffix of the emitted bundle, prefixed with the target name.
pub const BUNDLE_SUFFIX: &str = ".bundle.js";

/// Placeholder prefix used for positional template arguments (`:in0`, `:in1`, ...).
pub const PLACEHOLDER_PREFIX: &str = ":in";

/// Declared column types starting with this prefix are cast to `date` on select.
pub const TEMPORAL_TYPE_PREFIX: &str = "TIMESTAMP";

/// Owning schema the column catalog lookup is restricted to.
pub const DEFAULT_CATALOG_OWNER: &str = "SYSTEM";

/// Separator between the source object name and the function name in a
/// forwarding expression. Occurrences inside the object name are escaped.
pub const NAME_SEPARATOR: char = '.';

/// Upper bound on source text accepted by `save` (10 MB).
pub const MAX_SOURCE_LENGTH: usize = 10 * 1024 * 1024;
