/// Server setup and initialization
///
/// Wires together storage, the execution core, the route registrar and the HTTP
/// routes. Provides the application factory used by the binary and by tests.

use crate::{
    api::{create_invoke_routes, create_route_admin_routes, dispatch_dynamic, AppState, RouteRegistrar},
    config::Config,
    definition::{DefinitionStore, SqliteDefinitionStore},
    records::{RecordStore, SqliteRecordStore},
    runtime::{
        CrudBridge, ExecutionLogSink, FileLogSink, LogicDispatcher, SandboxLimits, ScriptDatabases,
        ScriptSandbox, WorkflowExecutor,
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;

/// Collaborators the execution core is built from
pub struct Collaborators {
    pub definitions: Arc<dyn DefinitionStore>,
    pub records: Arc<dyn RecordStore>,
    pub log_sink: Arc<dyn ExecutionLogSink>,
}

/// Build application state from configuration and collaborators
///
/// Publishes the initial route table before returning.
pub async fn build_state(config: &Config, collaborators: Collaborators) -> Result<AppState> {
    tracing::info!("⚙️ Initializing script sandbox");
    let databases = ScriptDatabases::connect(&config.execution.script_databases).await?;
    let sandbox = ScriptSandbox::new(SandboxLimits::from(&config.execution)).with_databases(databases);

    tracing::info!("🚀 Initializing workflow executor (max {} iterations)", config.execution.max_iterations);
    let workflows = WorkflowExecutor::new(
        sandbox.clone(),
        collaborators.log_sink,
        config.execution.max_iterations,
    );

    let crud = CrudBridge::new(
        collaborators.records,
        config.crud.default_page_size,
        config.crud.max_page_size,
    );
    let dispatcher = LogicDispatcher::new(
        Arc::clone(&collaborators.definitions),
        sandbox,
        workflows,
        crud,
    );

    tracing::info!("🔗 Loading dynamic routes");
    let registrar = Arc::new(RouteRegistrar::new(collaborators.definitions));
    registrar.load_all().await?;

    Ok(AppState { dispatcher, registrar })
}

/// Assemble the router: fixed routes first, dynamic endpoints as fallback
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Route table management
        .merge(create_route_admin_routes())
        // Workflow invocation by name
        .merge(create_invoke_routes())
        // Configuration-defined endpoints
        .fallback(dispatch_dynamic)
        .with_state(state)
}

/// Open (creating if needed) the SQLite database at `path`
pub async fn connect_database(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Failed to create database directory: {}", e))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database {}: {}", path, e))?;

    Ok(pool)
}

/// Create the main Axum application with all routes
///
/// Opens the SQLite database, creates schemas, and wires file-based execution logs.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Opening database: {}", config.database.path);
    let pool = connect_database(&config.database.path).await?;

    let definitions = SqliteDefinitionStore::new(pool.clone());
    definitions.init_schema().await?;
    let records = SqliteRecordStore::new(pool);
    records.init_schema().await?;

    tracing::info!("📝 Execution logs go to {}", config.logging.execution_log_dir);
    let collaborators = Collaborators {
        definitions: Arc::new(definitions),
        records: Arc::new(records),
        log_sink: Arc::new(FileLogSink::new(&config.logging.execution_log_dir)),
    };

    let state = build_state(&config, collaborators).await?;
    let app = build_router(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowgate server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        definition::{
            DataModel, EndpointDefinition, FieldType, LogicType, MemoryDefinitionStore, ModelField,
            WorkflowDefinition, WorkflowNode,
        },
        runtime::{log::RunStatus, MemoryLogSink},
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        store: Arc<MemoryDefinitionStore>,
        logs: Arc<MemoryLogSink>,
        state: AppState,
    }

    impl TestApp {
        fn router(&self) -> Router {
            build_router(self.state.clone())
        }
    }

    async fn test_app(store: MemoryDefinitionStore) -> TestApp {
        let store = Arc::new(store);
        let logs = Arc::new(MemoryLogSink::new());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let records = SqliteRecordStore::new(pool);
        records.init_schema().await.unwrap();

        let mut config = Config::default();
        config.execution.allow_http = false;
        config.execution.max_iterations = 1000;

        let state = build_state(
            &config,
            Collaborators {
                definitions: store.clone(),
                records: Arc::new(records),
                log_sink: logs.clone(),
            },
        )
        .await
        .unwrap();

        TestApp { store, logs, state }
    }

    fn endpoint(id: i64, method: &str, path: &str, logic_type: LogicType) -> EndpointDefinition {
        EndpointDefinition {
            id,
            name: format!("ep-{}", id),
            path: path.to_string(),
            method: method.to_string(),
            logic_type,
            enabled: true,
            code: None,
            response_template: None,
            model_id: None,
            workflow_id: None,
            description: None,
        }
    }

    fn workflow(id: i64, name: &str, nodes: &[(i64, &str)]) -> WorkflowDefinition {
        WorkflowDefinition {
            id,
            name: name.to_string(),
            enabled: true,
            description: None,
            nodes: nodes
                .iter()
                .map(|(index, code)| WorkflowNode {
                    index: *index,
                    name: format!("node-{}", index),
                    code: code.to_string(),
                })
                .collect(),
            connections: vec![],
        }
    }

    async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        router.oneshot(request.body(body).unwrap()).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(MemoryDefinitionStore::new()).await;
        let response = send(app.router(), "GET", "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_demo_workflow_via_invoke_endpoint() {
        let store = MemoryDefinitionStore::new();
        store
            .put_workflow(workflow(
                1,
                "demo",
                &[
                    (1, r#"data = { msg = "start" }; next_node = 2"#),
                    (2, "result = { done = true, echo = data }; next_node = 0"),
                ],
            ))
            .await;
        let app = test_app(store).await;

        let response = send(app.router(), "POST", "/workflow/api", Some(json!({"workflow_name": "demo"}))).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"done": true, "echo": {"msg": "start"}}));

        let entries = app.logs.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, RunStatus::Success);
        assert_eq!(entries[0].nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_self_loop_via_invoke_endpoint() {
        let store = MemoryDefinitionStore::new();
        store.put_workflow(workflow(2, "loop", &[(1, "next_node = 1")])).await;
        let app = test_app(store).await;

        let response = send(app.router(), "POST", "/workflow/api", Some(json!({"workflow_name": "loop"}))).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error_kind"], "LimitExceededError");
        assert_eq!(body["detail"]["node"], 1);
        assert!(body["detail"]["execution_id"].is_string());
        assert_eq!(app.logs.entries().await[0].iterations, 1000);
    }

    #[tokio::test]
    async fn test_invoke_rejects_bad_bodies_and_unknown_workflows() {
        let store = MemoryDefinitionStore::new();
        let mut disabled = workflow(3, "off", &[(1, "next_node = 0")]);
        disabled.enabled = false;
        store.put_workflow(disabled).await;
        let app = test_app(store).await;

        let missing_name = send(app.router(), "POST", "/workflow/api", Some(json!({"name": "x"}))).await;
        assert_eq!(missing_name.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(missing_name).await["error_kind"], "ValidationError");

        let not_json = send(app.router(), "POST", "/workflow/api", None).await;
        assert_eq!(not_json.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let unknown = send(app.router(), "POST", "/workflow/api", Some(json!({"workflow_name": "nope"}))).await;
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let off = send(app.router(), "POST", "/workflow/api", Some(json!({"workflow_name": "off"}))).await;
        assert_eq!(off.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dynamic_simple_endpoint_and_reload() {
        let store = MemoryDefinitionStore::new();
        let mut hello = endpoint(1, "GET", "/hello", LogicType::Simple);
        hello.response_template = Some("Hello {{context.query.name}}".to_string());
        store.put_endpoint(hello).await;
        let app = test_app(store).await;

        let response = send(app.router(), "GET", "/hello?name=Ann", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!("Hello Ann"));

        let response = send(app.router(), "GET", "/hello", None).await;
        assert_eq!(json_body(response).await, json!("Hello "));

        // New definitions are invisible until a reload
        let mut added = endpoint(2, "POST", "/echo/{word}", LogicType::Custom);
        added.code = Some("result = { word = context.path.word, body = context.body }".to_string());
        app.store.put_endpoint(added).await;

        let before = send(app.router(), "POST", "/echo/hi", Some(json!({"a": 1}))).await;
        assert_eq!(before.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(before).await["error_kind"], "NotFoundError");

        let reload = send(app.router(), "POST", "/api/routes/reload", None).await;
        assert_eq!(json_body(reload).await, json!({"routes": 2}));

        let after = send(app.router(), "POST", "/echo/hi", Some(json!({"a": 1}))).await;
        assert_eq!(after.status(), StatusCode::OK);
        assert_eq!(json_body(after).await, json!({"word": "hi", "body": {"a": 1}}));
    }

    #[tokio::test]
    async fn test_dynamic_crud_endpoints() {
        let store = MemoryDefinitionStore::new();
        store
            .put_data_model(DataModel {
                id: 1,
                name: "Task".to_string(),
                table_name: "tasks".to_string(),
                fields: vec![ModelField { name: "title".into(), field_type: FieldType::String, required: true }],
            })
            .await;
        for (id, method, path) in [
            (1, "GET", "/tasks"),
            (2, "POST", "/tasks"),
            (3, "GET", "/tasks/{id}"),
            (4, "DELETE", "/tasks/{id}"),
        ] {
            let mut crud = endpoint(id, method, path, LogicType::Crud);
            crud.model_id = Some(1);
            store.put_endpoint(crud).await;
        }
        let app = test_app(store).await;

        let created = send(app.router(), "POST", "/tasks", Some(json!({"title": "ship"}))).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let id = json_body(created).await["id"].as_i64().unwrap();

        let invalid = send(app.router(), "POST", "/tasks", Some(json!({}))).await;
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let listed = send(app.router(), "GET", "/tasks?page_size=1000", None).await;
        let body = json_body(listed).await;
        assert_eq!(body["page_size"], 100);
        assert_eq!(body["items"][0]["title"], "ship");

        let deleted = send(app.router(), "DELETE", &format!("/tasks/{}", id), None).await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let gone = send(app.router(), "GET", &format!("/tasks/{}", id), None).await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(gone).await, json!({"error": "not found"}));
    }

    #[tokio::test]
    async fn test_faulting_endpoint_does_not_affect_others() {
        let store = MemoryDefinitionStore::new();
        let mut bad = endpoint(1, "GET", "/bad", LogicType::Custom);
        bad.code = Some("error('broken')".to_string());
        let mut good = endpoint(2, "GET", "/good", LogicType::Custom);
        good.code = Some("result = 'fine'".to_string());
        store.put_endpoint(bad).await;
        store.put_endpoint(good).await;
        let app = test_app(store).await;

        let (bad, good) = tokio::join!(
            send(app.router(), "GET", "/bad", None),
            send(app.router(), "GET", "/good", None)
        );

        assert_eq!(bad.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(bad).await["error_kind"], "ScriptError");
        assert_eq!(good.status(), StatusCode::OK);
        assert_eq!(json_body(good).await, json!("fine"));
    }
}
