//! Integration tests for the session server.
//!
//! Uses axum-test; the WebSocket tests run over a real HTTP transport.

#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::{HeaderValue, header};
use axum_test::TestServer;
use mlepack::api::{AppState, HealthResponse, create_router};
use mlepack::bundle::{BundleOptions, LocalResolver};
use mlepack::deploy::Pipeline;
use mlepack::engine::{SandboxConnector, SandboxEngine};
use mlepack::session::SessionConfig;
use mlepack_core::{ColumnInfo, GeneratorConfig, SchemaCache};
use serde_json::{Value, json};
use std::sync::Arc;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn app_state(dir: &tempfile::TempDir) -> (AppState, Arc<SandboxEngine>) {
    let engine = Arc::new(SandboxEngine::new(Arc::new(SchemaCache::default())));
    engine.create_module_table("mlemodules").unwrap();
    engine
        .create_table(
            "notes",
            vec![ColumnInfo::new("ID", "NUMBER"), ColumnInfo::new("BODY", "VARCHAR2")],
        )
        .unwrap();
    let connector =
        Arc::new(SandboxConnector::new(Arc::clone(&engine)).with_account("scott", "tiger"));
    let config = SessionConfig {
        source_file: dir.path().join("mle.ts"),
        generator: GeneratorConfig::default(),
        bundle: BundleOptions::default(),
    };
    (
        AppState::new(connector, Pipeline::new(Arc::new(LocalResolver)), config),
        engine,
    )
}

fn create_ws_server(dir: &tempfile::TempDir) -> (TestServer, Arc<SandboxEngine>) {
    let (state, engine) = app_state(dir);
    let server = TestServer::builder()
        .http_transport()
        .build(create_router(state))
        .unwrap();
    (server, engine)
}

fn configure(password: &str) -> Value {
    json!({
        "type": "configure",
        "connectString": "localhost/pdb",
        "user": "scott",
        "password": password
    })
}

// =============================================================================
// HEALTH
// =============================================================================

#[tokio::test]
async fn health_reports_ok_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = app_state(&dir);
    let server = TestServer::new(create_router(state)).unwrap();

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: HealthResponse = response.json();
    assert_eq!(body.status, "ok");
    assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = app_state(&dir);
    let server = TestServer::new(create_router(state)).unwrap();

    server.get("/nope").await.assert_status_not_found();
}

#[tokio::test]
async fn local_origin_may_read_health_and_others_may_not() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _) = app_state(&dir);
    let server = TestServer::new(create_router(state)).unwrap();

    let allowed = server
        .get("/health")
        .add_header(header::ORIGIN, HeaderValue::from_static("http://localhost:3000"))
        .await;
    allowed.assert_status_ok();
    assert_eq!(
        allowed.header(header::ACCESS_CONTROL_ALLOW_ORIGIN),
        "http://localhost:3000"
    );

    let foreign = server
        .get("/health")
        .add_header(header::ORIGIN, HeaderValue::from_static("https://elsewhere.example"))
        .await;
    assert!(
        foreign
            .maybe_header(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none()
    );
}

// =============================================================================
// SESSION SOCKET
// =============================================================================

#[tokio::test]
async fn new_socket_starts_inactive() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = create_ws_server(&dir);
    let mut ws = server.get_websocket("/session").await.into_websocket().await;

    ws.send_json(&json!({ "type": "state" })).await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event, json!({ "event": "state", "state": "inactive" }));
}

#[tokio::test]
async fn unreadable_message_is_answered_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = create_ws_server(&dir);
    let mut ws = server.get_websocket("/session").await.into_websocket().await;

    ws.send_text("{\"type\":\"teleport\"}").await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["event"], "failure");
    assert!(event["message"].as_str().unwrap().starts_with("Invalid request"));
}

#[tokio::test]
async fn rejected_credentials_leave_session_inactive() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _) = create_ws_server(&dir);
    let mut ws = server.get_websocket("/session").await.into_websocket().await;

    ws.send_json(&configure("wrong")).await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["event"], "failure");
    assert!(event["message"].as_str().unwrap().contains("1017"));

    ws.send_json(&json!({ "type": "state" })).await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["state"], "inactive");
}

#[tokio::test]
async fn configure_then_execute_and_read_table() {
    let dir = tempfile::tempdir().unwrap();
    let (server, engine) = create_ws_server(&dir);
    let mut ws = server.get_websocket("/session").await.into_websocket().await;

    ws.send_json(&configure("tiger")).await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event, json!({ "event": "result", "status": "connected", "data": null }));

    ws.send_json(&json!({
        "type": "executeStatement",
        "sql": "INSERT INTO notes (id, body) VALUES (7, 'hello')"
    }))
    .await;
    let event: Value = ws.receive_json().await;
    assert_eq!(
        event,
        json!({ "event": "result", "status": "executed", "data": "Updated 1 row." })
    );
    assert_eq!(engine.row_count("notes"), Some(1));

    ws.send_json(&json!({ "type": "getTable", "table": "notes" })).await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["status"], "gotTable");
    assert_eq!(event["data"], json!([{ "id": 7, "body": "hello" }]));

    ws.send_json(&json!({ "type": "state" })).await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["state"], "active");
}

#[tokio::test]
async fn deployed_module_is_callable_without_installing_a_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let (server, engine) = create_ws_server(&dir);
    let mut ws = server.get_websocket("/session").await.into_websocket().await;

    ws.send_json(&configure("tiger")).await;
    let _: Value = ws.receive_json().await;

    ws.send_json(&json!({
        "type": "save",
        "file": "export function twice(x: number): number { return x * 2; }\n"
    }))
    .await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["status"], "saved");

    ws.send_json(&json!({ "type": "deploy" })).await;
    let deployed: Value = ws.receive_json().await;
    assert_eq!(deployed["status"], "deployed");
    assert_eq!(deployed["data"]["functions"], json!(["twice"]));
    let reconnected: Value = ws.receive_json().await;
    assert_eq!(reconnected["status"], "connected");
    assert_eq!(engine.wrappers(), vec!["TWICE"]);

    assert_eq!(engine.loaded_functions("mlemodules"), vec!["twice"]);

    ws.send_json(&json!({
        "type": "executeFunction",
        "id": 3,
        "func": "twice",
        "params": [21]
    }))
    .await;
    let event: Value = ws.receive_json().await;
    assert_eq!(event["status"], "tested");
    assert_eq!(event["data"]["id"], 3);
    assert_eq!(event["data"]["data"], "42");
}
