//! # mlepack CLI Module
//!
//! ## Available Commands
//!
//! - `pack` - Extract, bundle, generate and deploy a module
//! - `inspect` - Show descriptors and generated statements without connecting
//! - `serve` - Start the session server

mod commands;

use clap::{Parser, Subcommand};
use mlepack_core::MleError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// mlepack - build and deploy script modules into a database engine
#[derive(Parser, Debug)]
#[command(name = "mlepack")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file (default: mlepack.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a module and deploy it
    Pack {
        /// Entry module file
        file: PathBuf,

        /// Source object name
        #[arg(short, long)]
        name: Option<String>,

        /// Module table name
        #[arg(short, long)]
        table: Option<String>,

        /// Engine connect string
        #[arg(long)]
        connect_string: Option<String>,

        /// Engine user
        #[arg(short, long)]
        user: Option<String>,

        /// Engine password
        #[arg(short, long)]
        password: Option<String>,

        /// Write the artifact files to the output directory
        #[arg(long)]
        emit_files: bool,

        /// Print bundle statistics
        #[arg(long)]
        emit_stats: bool,

        /// Output directory for emitted files
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show what a module would deploy
    Inspect {
        /// Entry module file
        file: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Start the session server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short = 'P', long)]
        port: Option<u16>,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), MleError> {
    let mut config = crate::config::Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Pack {
            file,
            name,
            table,
            connect_string,
            user,
            password,
            emit_files,
            emit_stats,
            output,
        } => {
            if let Some(name) = name {
                config.module.name = name;
            }
            if let Some(table) = table {
                config.module.table = table;
            }
            if let Some(cs) = connect_string {
                config.connection.connect_string = cs;
            }
            if let Some(user) = user {
                config.connection.user = user;
            }
            if let Some(password) = password {
                config.connection.password = password;
            }
            if let Some(dir) = output {
                config.output.dir = dir;
            }
            config.output.emit_files |= emit_files;
            config.output.emit_stats |= emit_stats;
            cmd_pack(&config, &file, cli.verbose).await
        }
        Commands::Inspect { file, json } => cmd_inspect(&config, &file, json).await,
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_serve(&config, cli.verbose).await
        }
    }
}
