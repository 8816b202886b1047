/// Logic dispatcher
///
/// Routes an endpoint definition plus its request context to the matching
/// execution strategy and normalizes whatever comes back into an `HttpResult`.
/// Dispatch never fails: every error becomes a structured JSON body.

use crate::{
    definition::{DefinitionStore, EndpointDefinition, LogicType},
    error::{AppError, AppResult},
    runtime::{
        context::RequestContext,
        crud::CrudBridge,
        sandbox::ScriptSandbox,
        template,
        workflow::{RunOutcome, WorkflowExecutor},
    },
};
use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// HTTP-shaped result of a dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResult {
    pub status: StatusCode,
    /// `None` for bodiless responses such as 204
    pub body: Option<Value>,
}

impl HttpResult {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body: Some(body) }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn empty(status: StatusCode) -> Self {
        Self { status, body: None }
    }

    pub fn from_error(error: &AppError) -> Self {
        if matches!(error, AppError::Storage(_)) {
            tracing::error!("❌ Storage failure during dispatch: {}", error);
        }
        Self::new(error.status_code(), error.to_json())
    }

    /// 200 with final data, or 500 with the run's structured failure
    pub fn from_run(outcome: &RunOutcome) -> Self {
        match outcome.error_body() {
            None => Self::ok(outcome.data.clone()),
            Some(body) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, body),
        }
    }
}

impl IntoResponse for HttpResult {
    fn into_response(self) -> Response {
        match self.body {
            Some(body) => (self.status, Json(body)).into_response(),
            None => self.status.into_response(),
        }
    }
}

/// Strategy router shared by every dynamic route
#[derive(Clone)]
pub struct LogicDispatcher {
    definitions: Arc<dyn DefinitionStore>,
    sandbox: ScriptSandbox,
    workflows: WorkflowExecutor,
    crud: CrudBridge,
}

impl LogicDispatcher {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        sandbox: ScriptSandbox,
        workflows: WorkflowExecutor,
        crud: CrudBridge,
    ) -> Self {
        Self { definitions, sandbox, workflows, crud }
    }

    pub fn workflows(&self) -> &WorkflowExecutor {
        &self.workflows
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    /// Execute `endpoint` for one request
    pub async fn dispatch(&self, endpoint: &EndpointDefinition, context: &RequestContext) -> HttpResult {
        tracing::debug!(
            "📥 Dispatching {} {} to endpoint '{}' ({})",
            context.method,
            context.uri,
            endpoint.name,
            endpoint.logic_type.as_str()
        );

        let outcome = match endpoint.logic_type {
            LogicType::Simple => self.simple(endpoint, context).await,
            LogicType::Crud => self.crud(endpoint, context).await,
            LogicType::Workflow => self.workflow(endpoint, context).await,
            LogicType::Custom => self.custom(endpoint, context).await,
        };

        match outcome {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(
                    "⚠️ Endpoint '{}' failed: {} ({})",
                    endpoint.name,
                    error,
                    error.kind()
                );
                HttpResult::from_error(&error)
            }
        }
    }

    async fn simple(&self, endpoint: &EndpointDefinition, context: &RequestContext) -> AppResult<HttpResult> {
        if let Some(code) = non_empty(&endpoint.code) {
            let outputs = self.sandbox.run(code, script_bindings(context)).await?;
            let body = outputs.result.unwrap_or_else(|| json!({"message": "code executed"}));
            return Ok(HttpResult::ok(body));
        }

        if let Some(template) = non_empty(&endpoint.response_template) {
            let body = match serde_json::from_str::<Value>(template) {
                Ok(json_template @ (Value::Object(_) | Value::Array(_))) => {
                    template::render_value(&json_template, context)
                }
                _ => Value::String(template::render(template, context)),
            };
            return Ok(HttpResult::ok(body));
        }

        Ok(HttpResult::ok(json!({
            "message": format!("endpoint {} executed", endpoint.name)
        })))
    }

    async fn crud(&self, endpoint: &EndpointDefinition, context: &RequestContext) -> AppResult<HttpResult> {
        let model_id = endpoint.model_id.ok_or_else(|| {
            AppError::Config(format!("crud endpoint '{}' has no data model", endpoint.name))
        })?;
        let model = self
            .definitions
            .get_data_model(model_id)
            .await?
            .ok_or_else(|| AppError::Config(format!("data model {} does not exist", model_id)))?;

        let method = Method::from_bytes(context.method.as_bytes()).unwrap_or(Method::GET);
        Ok(self.crud.handle(&method, &model, context).await)
    }

    async fn workflow(&self, endpoint: &EndpointDefinition, context: &RequestContext) -> AppResult<HttpResult> {
        let workflow_id = endpoint.workflow_id.ok_or_else(|| {
            AppError::Config(format!("workflow endpoint '{}' has no workflow", endpoint.name))
        })?;
        let workflow = self
            .definitions
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| AppError::Config(format!("workflow {} does not exist", workflow_id)))?;
        if !workflow.enabled {
            return Err(AppError::NotFound(format!("workflow '{}' is disabled", workflow.name)));
        }

        let outcome = self.workflows.run(&workflow, context).await;
        Ok(HttpResult::from_run(&outcome))
    }

    async fn custom(&self, endpoint: &EndpointDefinition, context: &RequestContext) -> AppResult<HttpResult> {
        let code = non_empty(&endpoint.code).ok_or_else(|| {
            AppError::Config(format!("custom endpoint '{}' has no code", endpoint.name))
        })?;

        let outputs = self.sandbox.run(code, script_bindings(context)).await?;
        Ok(HttpResult::ok(outputs.result.unwrap_or(Value::Null)))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// Bindings for endpoint-level scripts: `context` and `request`
fn script_bindings(context: &RequestContext) -> Map<String, Value> {
    let mut bindings = Map::new();
    bindings.insert("context".to_string(), context.to_value());
    bindings.insert("request".to_string(), context.request_value());
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        definition::{DataModel, FieldType, MemoryDefinitionStore, ModelField, WorkflowDefinition, WorkflowNode},
        records::SqliteRecordStore,
        runtime::{context::RawRequest, log::MemoryLogSink, sandbox::SandboxLimits},
    };
    use axum::http::HeaderMap;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::{collections::HashMap, time::Duration};

    async fn dispatcher(store: Arc<MemoryDefinitionStore>) -> LogicDispatcher {
        let sandbox = ScriptSandbox::new(SandboxLimits {
            instruction_limit: 1_000_000,
            memory_limit_bytes: 16 * 1024 * 1024,
            allow_http: false,
            http_timeout: Duration::from_secs(1),
        });
        let workflows = WorkflowExecutor::new(sandbox.clone(), Arc::new(MemoryLogSink::new()), 1000);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let records = SqliteRecordStore::new(pool);
        records.init_schema().await.unwrap();

        LogicDispatcher::new(store, sandbox, workflows, CrudBridge::new(Arc::new(records), 20, 100))
    }

    fn endpoint(logic_type: LogicType) -> EndpointDefinition {
        EndpointDefinition {
            id: 1,
            name: "hello".to_string(),
            path: "/hello".to_string(),
            method: "GET".to_string(),
            logic_type,
            enabled: true,
            code: None,
            response_template: None,
            model_id: None,
            workflow_id: None,
            description: None,
        }
    }

    fn context(method: Method, query: &str) -> RequestContext {
        RequestContext::build(RawRequest {
            method,
            path: "/hello".to_string(),
            path_params: HashMap::new(),
            query: Some(query.to_string()),
            headers: HeaderMap::new(),
            body: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_simple_template_scenario() {
        let dispatcher = dispatcher(Arc::new(MemoryDefinitionStore::new())).await;
        let mut hello = endpoint(LogicType::Simple);
        hello.response_template = Some("Hello {{context.query.name}}".to_string());

        let with_name = dispatcher.dispatch(&hello, &context(Method::GET, "name=Ann")).await;
        assert_eq!(with_name, HttpResult::ok(json!("Hello Ann")));

        let without = dispatcher.dispatch(&hello, &context(Method::GET, "")).await;
        assert_eq!(without.body, Some(json!("Hello ")));
    }

    #[tokio::test]
    async fn test_simple_json_template_and_fallbacks() {
        let dispatcher = dispatcher(Arc::new(MemoryDefinitionStore::new())).await;

        let mut json_template = endpoint(LogicType::Simple);
        json_template.response_template = Some(r#"{"greeting": "Hi {{query.name}}"}"#.to_string());
        let result = dispatcher.dispatch(&json_template, &context(Method::GET, "name=Bo")).await;
        assert_eq!(result.body, Some(json!({"greeting": "Hi Bo"})));

        let bare = dispatcher.dispatch(&endpoint(LogicType::Simple), &context(Method::GET, "")).await;
        assert_eq!(bare.body, Some(json!({"message": "endpoint hello executed"})));

        let mut code = endpoint(LogicType::Simple);
        code.code = Some("local x = 1".to_string());
        let result = dispatcher.dispatch(&code, &context(Method::GET, "")).await;
        assert_eq!(result.body, Some(json!({"message": "code executed"})));
    }

    #[tokio::test]
    async fn test_custom_code_result_and_fault() {
        let dispatcher = dispatcher(Arc::new(MemoryDefinitionStore::new())).await;

        let mut custom = endpoint(LogicType::Custom);
        custom.code = Some("result = { q = context.query.q, m = request.method }".to_string());
        let result = dispatcher.dispatch(&custom, &context(Method::POST, "q=rust")).await;
        assert_eq!(result, HttpResult::ok(json!({"q": "rust", "m": "POST"})));

        custom.code = Some("error('nope')".to_string());
        let failed = dispatcher.dispatch(&custom, &context(Method::POST, "")).await;
        assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.body.unwrap()["error_kind"], "ScriptError");

        let no_code = dispatcher.dispatch(&endpoint(LogicType::Custom), &context(Method::GET, "")).await;
        assert_eq!(no_code.body.unwrap()["error_kind"], "ConfigError");
    }

    #[tokio::test]
    async fn test_workflow_endpoint_and_missing_references() {
        let store = Arc::new(MemoryDefinitionStore::new());
        store
            .put_workflow(WorkflowDefinition {
                id: 5,
                name: "greet".to_string(),
                enabled: true,
                description: None,
                nodes: vec![WorkflowNode {
                    index: 1,
                    name: "only".to_string(),
                    code: "result = { hi = context.query.name }; next_node = 0".to_string(),
                }],
                connections: vec![],
            })
            .await;
        let dispatcher = dispatcher(store).await;

        let mut wf = endpoint(LogicType::Workflow);
        wf.workflow_id = Some(5);
        let result = dispatcher.dispatch(&wf, &context(Method::GET, "name=Ann")).await;
        assert_eq!(result, HttpResult::ok(json!({"hi": "Ann"})));

        wf.workflow_id = Some(6);
        let missing = dispatcher.dispatch(&wf, &context(Method::GET, "")).await;
        assert_eq!(missing.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(missing.body.unwrap()["error_kind"], "ConfigError");

        let mut crud = endpoint(LogicType::Crud);
        crud.model_id = Some(9);
        let missing_model = dispatcher.dispatch(&crud, &context(Method::GET, "")).await;
        assert_eq!(missing_model.body.unwrap()["error_kind"], "ConfigError");
    }

    #[tokio::test]
    async fn test_crud_endpoint_delegates_to_bridge() {
        let store = Arc::new(MemoryDefinitionStore::new());
        store
            .put_data_model(DataModel {
                id: 2,
                name: "Note".to_string(),
                table_name: "notes".to_string(),
                fields: vec![ModelField { name: "text".into(), field_type: FieldType::Text, required: true }],
            })
            .await;
        let dispatcher = dispatcher(store).await;

        let mut notes = endpoint(LogicType::Crud);
        notes.model_id = Some(2);
        let listed = dispatcher.dispatch(&notes, &context(Method::GET, "")).await;
        assert_eq!(listed.status, StatusCode::OK);
        assert_eq!(listed.body.unwrap()["total"], 0);
    }
}
