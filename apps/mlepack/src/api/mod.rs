//! # Session Server
//!
//! axum server exposing gated sessions over WebSocket.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /session` - WebSocket upgrade; one session per socket
//!
//! ## Configuration (Environment Variables)
//!
//! - `MLEPACK_CORS_ORIGINS`: Comma-separated origins allowed to open a
//!   session socket, or "*" for any (default: local development origins)

mod handlers;
mod types;

pub use handlers::{health_handler, session_handler};
pub use types::{BatchCaseJson, ClientMessage, HealthResponse, ServerEvent};

use crate::deploy::Pipeline;
use crate::engine::Connector;
use crate::session::{Session, SessionConfig};
use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::get,
};
use mlepack_core::MleError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// What every session of the server shares.
#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<dyn Connector>,
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<SessionConfig>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, pipeline: Pipeline, config: SessionConfig) -> Self {
        Self {
            connector,
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A fresh session with the next id.
    #[must_use]
    pub fn new_session(&self) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Session::new(
            id,
            Arc::clone(&self.connector),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.config),
        )
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

const LOCAL_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:8080",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:8080",
];

/// Origins allowed to open a session socket.
#[derive(Debug, Clone, PartialEq)]
enum SocketOrigins {
    Any,
    Listed(Vec<HeaderValue>),
}

/// Read an `MLEPACK_CORS_ORIGINS` value.
///
/// - `"*"`: any origin
/// - unset, or no parseable entry: the local development origins
/// - otherwise: the comma-separated list
fn socket_origins(value: Option<&str>) -> SocketOrigins {
    let listed = match value.map(str::trim) {
        Some("*") => {
            tracing::warn!("CORS: allowing every origin to open sessions");
            return SocketOrigins::Any;
        }
        Some(origins) => origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(origin) => Some(origin),
                Err(e) => {
                    tracing::warn!("CORS: ignoring origin '{}': {}", o, e);
                    None
                }
            })
            .collect(),
        None => Vec::new(),
    };

    if listed.is_empty() {
        tracing::info!("CORS: sessions limited to local origins");
        return SocketOrigins::Listed(
            LOCAL_ORIGINS.into_iter().map(HeaderValue::from_static).collect(),
        );
    }
    tracing::info!("CORS: sessions allowed from {} origin(s)", listed.len());
    SocketOrigins::Listed(listed)
}

/// Cross-origin policy for the two `GET` routes.
///
/// A socket upgrade is a plain `GET` without a preflight, so only `GET` is
/// allowed and no request headers are exposed.
fn build_cors_layer() -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);
    match socket_origins(std::env::var("MLEPACK_CORS_ORIGINS").ok().as_deref()) {
        SocketOrigins::Any => layer.allow_origin(cors::Any),
        SocketOrigins::Listed(origins) => layer.allow_origin(origins),
    }
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the router. CORS is outermost-but-one, tracing outermost.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/session", get(handlers::session_handler))
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Bind `addr` and serve until the process receives Ctrl-C.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), MleError> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| MleError::Io(format!("Bind failed: {}", e)))?;

    tracing::info!("mlepack session server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
            }
        })
        .await
        .map_err(|e| MleError::Io(format!("Server error: {}", e)))
}
