//! Integration tests for gated sessions against the sandbox engine.

#![allow(clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use mlepack::bundle::{BundleOptions, LocalResolver};
use mlepack::deploy::Pipeline;
use mlepack::engine::{Connection, ConnectionOptions, Connector, SandboxConnector, SandboxEngine};
use mlepack::session::{BatchCase, GateOutcome, Operation, Session, SessionConfig};
use mlepack_core::{
    ColumnInfo, Dispatcher, EngineError, GateState, GeneratorConfig, SchemaCache, Template,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

const MODULE: &str = "\
export function add(a: number, b: number): number { return a + b; }
export const greet = (name: string): string => 'hi ' + name;
export function audit(message: string): void {}
function hidden(x: number): number { return x; }
";

// =============================================================================
// HELPERS
// =============================================================================

struct Fixture {
    engine: Arc<SandboxEngine>,
    session: Arc<Session>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let engine = Arc::new(SandboxEngine::new(Arc::new(SchemaCache::default())));
    engine.create_module_table("mlemodules").unwrap();
    let connector = SandboxConnector::new(Arc::clone(&engine)).with_account("scott", "tiger");
    session_over(engine, Arc::new(connector))
}

fn session_over(engine: Arc<SandboxEngine>, connector: Arc<dyn Connector>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        source_file: dir.path().join("mle.ts"),
        generator: GeneratorConfig::default(),
        bundle: BundleOptions {
            name: "mlemodules".into(),
            ..BundleOptions::default()
        },
    };
    let session = Session::new(
        1,
        connector,
        Arc::new(Pipeline::new(Arc::new(LocalResolver))),
        Arc::new(config),
    );
    Fixture {
        engine,
        session: Arc::new(session),
        _dir: dir,
    }
}

fn scott() -> ConnectionOptions {
    ConnectionOptions::new("localhost/pdb", "scott", "tiger")
}

async fn one(session: &Session, op: Operation) -> GateOutcome {
    let mut outcomes = session.handle(op).await;
    assert_eq!(outcomes.len(), 1, "expected a single outcome");
    outcomes.remove(0)
}

fn data(outcome: GateOutcome, expected_status: &str) -> Value {
    match outcome {
        GateOutcome::Success { status, data } => {
            assert_eq!(status, expected_status);
            data
        }
        other => panic!("expected success, got {other:?}"),
    }
}

fn module_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register("add", |_, args| {
        let a = args[0].as_i64().unwrap_or_default();
        let b = args[1].as_i64().unwrap_or_default();
        Ok(json!(a + b))
    });
    dispatcher.register("greet", |_, args| {
        Ok(json!(format!("hi {}", args[0].as_str().unwrap_or_default())))
    });
    dispatcher.register("audit", |_, _| Ok(Value::Null));
    dispatcher
}

// =============================================================================
// GATE BEHAVIOUR
// =============================================================================

#[tokio::test]
async fn state_starts_inactive() {
    let f = fixture();
    assert_eq!(f.session.state(), GateState::Inactive);
}

#[tokio::test]
async fn bad_credentials_fail_and_leave_session_inactive() {
    let f = fixture();
    let outcome = one(
        &f.session,
        Operation::Configure(ConnectionOptions::new("localhost/pdb", "scott", "wrong")),
    )
    .await;

    let GateOutcome::Failure(message) = outcome else {
        panic!("expected failure");
    };
    assert!(message.starts_with("Failure while creating a database connection"));
    assert!(message.contains("1017"));
    assert_eq!(f.session.state(), GateState::Inactive);
}

#[tokio::test]
async fn operations_without_connection_fail() {
    let f = fixture();
    let outcome = one(&f.session, Operation::ExecuteStatement("SELECT * FROM mlemodules".into())).await;
    assert!(matches!(outcome, GateOutcome::Failure(_)));
    assert_eq!(f.session.state(), GateState::Inactive);
}

/// Connects only after being released.
struct Stalled {
    inner: SandboxConnector,
    release: Arc<Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl Connector for Stalled {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Connection>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        self.inner.connect(options).await
    }
}

#[tokio::test]
async fn second_operation_while_pending_is_busy() {
    let engine = Arc::new(SandboxEngine::new(Arc::new(SchemaCache::default())));
    let release = Arc::new(Notify::new());
    let stalled = Arc::new(Stalled {
        inner: SandboxConnector::new(Arc::clone(&engine)),
        release: Arc::clone(&release),
        calls: AtomicUsize::new(0),
    });
    let f = session_over(engine, stalled.clone());

    let first = {
        let session = Arc::clone(&f.session);
        tokio::spawn(async move { session.handle(Operation::Configure(scott())).await })
    };
    while f.session.state() != GateState::Pending {
        tokio::task::yield_now().await;
    }

    let second = f.session.handle(Operation::Configure(scott())).await;
    assert_eq!(second, vec![GateOutcome::Busy]);
    assert_eq!(f.session.state(), GateState::Pending);

    release.notify_one();
    let first = first.await.unwrap();
    assert!(matches!(first[0], GateOutcome::Success { .. }));
    assert_eq!(stalled.calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.session.state(), GateState::Active);
}

// =============================================================================
// OPERATIONS
// =============================================================================

#[tokio::test]
async fn save_deploy_and_call_functions() {
    let f = fixture();
    data(one(&f.session, Operation::Configure(scott())).await, "connected");
    data(one(&f.session, Operation::Save(MODULE.into())).await, "saved");

    let outcomes = f.session.handle(Operation::Deploy).await;
    assert_eq!(outcomes.len(), 2, "deploy is followed by a reconnect");
    let deployed = data(outcomes[0].clone(), "deployed");
    assert_eq!(deployed["functions"], json!(["add", "greet", "audit"]));
    data(outcomes[1].clone(), "connected");

    assert!(f.engine.has_source("mlemodules"));
    assert_eq!(f.engine.wrappers(), vec!["ADD", "AUDIT", "GREET"]);

    let types = data(one(&f.session, Operation::GetSchemaTypes).await, "gotTypes");
    assert_eq!(types[0]["name"], "add");
    assert_eq!(types[0]["returnType"], 1);
    assert_eq!(types[2]["returnType"], 2);

    f.engine.install_module("mlemodules", module_dispatcher());

    let tested = data(
        one(
            &f.session,
            Operation::ExecuteFunction {
                id: json!("t1"),
                name: "add".into(),
                params: vec![json!(2), json!(3)],
            },
        )
        .await,
        "tested",
    );
    assert_eq!(
        tested,
        json!({ "id": "t1", "func": "add", "params": [2, 3], "data": "5" })
    );

    let batch = data(
        one(
            &f.session,
            Operation::ExecuteBatch(vec![
                BatchCase {
                    id: json!(1),
                    name: "add".into(),
                    params: vec![json!(1), json!(1)],
                },
                BatchCase {
                    id: json!(2),
                    name: "greet".into(),
                    params: vec![json!("o'brien")],
                },
            ]),
        )
        .await,
        "testedMultiple",
    );
    assert_eq!(
        batch,
        json!([{ "id": 1, "result": 2 }, { "id": 2, "result": "hi o'brien" }])
    );
}

#[tokio::test]
async fn failed_deploy_still_reconnects() {
    let f = fixture();
    data(one(&f.session, Operation::Configure(scott())).await, "connected");

    let outcomes = f.session.handle(Operation::Deploy).await;
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0], GateOutcome::Failure(_)), "nothing was saved");
    data(outcomes[1].clone(), "connected");
    assert_eq!(f.session.state(), GateState::Active);
}

#[tokio::test]
async fn deploy_before_configure_fails_both_steps() {
    let f = fixture();

    let outcomes = f.session.handle(Operation::Deploy).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, GateOutcome::Failure(_))));
    assert_eq!(f.session.state(), GateState::Inactive);
}

#[tokio::test]
async fn failed_function_call_reports_context() {
    let f = fixture();
    data(one(&f.session, Operation::Configure(scott())).await, "connected");

    let outcome = one(
        &f.session,
        Operation::ExecuteFunction {
            id: Value::Null,
            name: "missing".into(),
            params: vec![json!(1), json!("x")],
        },
    )
    .await;
    let GateOutcome::Failure(message) = outcome else {
        panic!("expected failure");
    };
    assert!(message.starts_with("Failure while executing function missing with 1, x: "));
    assert_eq!(f.session.state(), GateState::Inactive);
}

#[tokio::test]
async fn statements_tables_and_status_lines() {
    let f = fixture();
    f.engine
        .create_table(
            "people",
            vec![ColumnInfo::new("ID", "NUMBER"), ColumnInfo::new("NAME", "VARCHAR2")],
        )
        .unwrap();
    data(one(&f.session, Operation::Configure(scott())).await, "connected");

    let inserted = data(
        one(
            &f.session,
            Operation::ExecuteStatement("INSERT INTO people (id, name) VALUES (1, 'ada')".into()),
        )
        .await,
        "executed",
    );
    assert_eq!(inserted, json!("Updated 1 row."));

    let rows = data(one(&f.session, Operation::GetTable("people".into())).await, "gotTable");
    assert_eq!(rows, json!([{ "id": 1, "name": "ada" }]));

    let updated = data(
        one(&f.session, Operation::ExecuteStatement("UPDATE people SET name = 'grace'".into())).await,
        "executed",
    );
    assert_eq!(updated, json!("Updated 1 row."));
}

#[tokio::test]
async fn engine_errors_carry_code_and_position() {
    let f = fixture();
    data(one(&f.session, Operation::Configure(scott())).await, "connected");

    let outcome = one(&f.session, Operation::ExecuteStatement("SELECT * FROM nowhere".into())).await;
    assert_eq!(
        outcome,
        GateOutcome::Failure(
            "Failure while executing sql \"SELECT * FROM nowhere\": '942: table or view \"NOWHERE\" does not exist at position 14.'"
                .into()
        )
    );
}

#[tokio::test]
async fn get_table_rejects_non_identifiers() {
    let f = fixture();
    data(one(&f.session, Operation::Configure(scott())).await, "connected");
    let outcome = one(&f.session, Operation::GetTable("people; drop table x".into())).await;
    assert_eq!(
        outcome,
        GateOutcome::Failure(
            "Failure while trying to read from table \"people; drop table x\"".into()
        )
    );
}

#[tokio::test]
async fn benchmark_averages_per_project() {
    let f = fixture();
    f.engine
        .create_table("PROJECTS", vec![ColumnInfo::new("ID", "NUMBER")])
        .unwrap();
    f.engine
        .create_table(
            "pull_requests",
            vec![ColumnInfo::new("ID", "NUMBER"), ColumnInfo::new("HEAD_REPO_ID", "NUMBER")],
        )
        .unwrap();
    f.engine
        .create_table(
            "pull_request_history",
            vec![
                ColumnInfo::new("PULL_REQUEST_ID", "NUMBER"),
                ColumnInfo::new("CREATED_AT", "TIMESTAMP(6)"),
                ColumnInfo::new("ACTION", "VARCHAR2"),
            ],
        )
        .unwrap();

    for project in [1, 2, 3] {
        f.engine.insert_row("PROJECTS", vec![json!(project)]).unwrap();
    }
    // Project 1: PRs of 1000 and 3000 ms. Project 2: one PR of 500 ms.
    // Project 3: a PR that never closed.
    for (pr, repo) in [(10, 1), (11, 1), (20, 2), (30, 3)] {
        f.engine.insert_row("pull_requests", vec![json!(pr), json!(repo)]).unwrap();
    }
    let history = [
        (10, 0, "opened"),
        (10, 1_000, "closed"),
        (11, 0, "opened"),
        (11, 3_000, "merged"),
        (20, 100, "opened"),
        (20, 600, "closed"),
        (30, 0, "opened"),
    ];
    for (pr, at, action) in history {
        f.engine
            .insert_row("pull_request_history", vec![json!(pr), json!(at), json!(action)])
            .unwrap();
    }

    data(one(&f.session, Operation::Configure(scott())).await, "connected");
    let averages = data(one(&f.session, Operation::RunBenchmark).await, "benchmarked");
    assert_eq!(averages, json!([500, 2000]));
}

#[tokio::test]
async fn runtime_queries_from_deployed_functions_use_the_cache() {
    let f = fixture();
    f.engine
        .create_table(
            "events",
            vec![ColumnInfo::new("ID", "NUMBER"), ColumnInfo::new("AT", "TIMESTAMP(6)")],
        )
        .unwrap();
    f.engine
        .insert_row("events", vec![json!(1), json!("2021-01-01T10:00:00.750Z")])
        .unwrap();

    data(one(&f.session, Operation::Configure(scott())).await, "connected");
    data(
        one(
            &f.session,
            Operation::Save("export function latest(): string { return ''; }\n".into()),
        )
        .await,
        "saved",
    );
    let outcomes = f.session.handle(Operation::Deploy).await;
    data(outcomes[0].clone(), "deployed");

    let mut dispatcher = Dispatcher::new();
    dispatcher.register("latest", |runtime, _| {
        let result = runtime.sql(&Template::literal("select * from events"))?;
        Ok(Value::String(result.to_value().to_string()))
    });
    f.engine.install_module("mlemodules", dispatcher);

    let tested = data(
        one(
            &f.session,
            Operation::ExecuteFunction {
                id: json!(1),
                name: "latest".into(),
                params: Vec::new(),
            },
        )
        .await,
        "tested",
    );
    let rows: Value = serde_json::from_str(tested["data"].as_str().unwrap()).unwrap();
    assert_eq!(rows, json!([{ "id": 1, "at": "2021-01-01T10:00:00Z" }]));
    assert!(f.engine.cache().get("EVENTS").is_some());
}
