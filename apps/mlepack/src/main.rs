//! # mlepack
//!
//! Builds script modules into deployable engine statements and serves
//! interactive sessions against an engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 apps/mlepack (THE BINARY)                │
//! │                                                          │
//! │  ┌──────────┐   ┌──────────────┐   ┌─────────────────┐   │
//! │  │   CLI    │   │ Session API  │   │ Pack pipeline   │   │
//! │  │  (clap)  │   │ (axum + ws)  │   │ bundle + deploy │   │
//! │  └────┬─────┘   └──────┬───────┘   └────────┬────────┘   │
//! │       └────────────────┼────────────────────┘            │
//! │                        ▼                                 │
//! │                ┌───────────────┐                         │
//! │                │ mlepack-core  │                         │
//! │                │  (THE LOGIC)  │                         │
//! │                └───────────────┘                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! mlepack pack mle.ts --user scott --password tiger --emit-files
//! mlepack inspect mle.ts --json
//! mlepack serve --host 0.0.0.0 --port 8080
//! ```

use clap::Parser;
use mlepack::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // MLEPACK_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("MLEPACK_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let default_filter = if cli.verbose {
        "mlepack=debug,tower_http=debug"
    } else {
        "mlepack=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    if !cli.quiet {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  mlepack v{}

  extract • bundle • generate • deploy
"#,
        env!("CARGO_PKG_VERSION")
    );
}
