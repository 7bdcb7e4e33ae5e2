//! # API Endpoint Handlers
//!
//! Health check and the session WebSocket.

use super::{
    AppState,
    types::{ClientMessage, HealthResponse, ServerEvent},
};
use crate::session::Session;
use axum::{
    Json,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// SESSION HANDLER
// =============================================================================

/// Upgrade to a WebSocket owning one fresh session.
pub async fn session_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session = Arc::new(state.new_session());
    ws.on_upgrade(move |socket| run_session(socket, session))
}

/// Read client messages until the socket closes.
///
/// Each message runs on its own task so that a message arriving while an
/// operation is pending reaches the gate and observes `busy`. All outgoing
/// events funnel through one writer task.
async fn run_session(socket: WebSocket, session: Arc<Session>) {
    let id = session.id();
    tracing::info!("session {} opened", id);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Serializing event failed: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let message = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("session {} sent an unreadable message: {}", id, e);
                let _ = tx.send(ServerEvent::Failure {
                    message: format!("Invalid request: {e}"),
                });
                continue;
            }
        };

        let Some(operation) = message.into_operation() else {
            let _ = tx.send(ServerEvent::State {
                state: session.state(),
            });
            continue;
        };

        let session = Arc::clone(&session);
        let tx = tx.clone();
        tokio::spawn(async move {
            for outcome in session.handle(operation).await {
                if tx.send(ServerEvent::from(outcome)).is_err() {
                    break;
                }
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    tracing::info!("session {} closed", id);
}
