/// Unified workflow invocation endpoint
///
/// `POST /workflow/api` runs an enabled workflow by name, independent of any
/// endpoint definition bound to it.

use crate::{
    api::{routes::isolated, AppState},
    error::AppError,
    runtime::{
        context::{RawRequest, RequestContext},
        dispatcher::HttpResult,
    },
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use std::collections::HashMap;

/// Request body for workflow invocation
#[derive(Debug, Deserialize)]
pub struct InvokeWorkflowRequest {
    pub workflow_name: String,
}

/// Create the workflow invocation route
pub fn create_invoke_routes() -> Router<AppState> {
    Router::new().route("/workflow/api", post(invoke_workflow))
}

/// Run a workflow by name
///
/// POST /workflow/api
/// Body: { "workflow_name": "demo" }
async fn invoke_workflow(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: InvokeWorkflowRequest = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("❌ Invalid workflow invocation body: {}", e);
            return AppError::validation(format!("invalid request body: {}", e)).into_response();
        }
    };
    if payload.workflow_name.trim().is_empty() {
        return AppError::validation("workflow_name must not be empty").into_response();
    }

    tracing::info!("📥 Workflow invocation: {}", payload.workflow_name);

    let workflow = match state
        .dispatcher
        .definitions()
        .get_workflow_by_name(&payload.workflow_name)
        .await
    {
        Ok(Some(workflow)) if workflow.enabled => workflow,
        Ok(_) => {
            tracing::warn!("❌ Unknown or disabled workflow: {}", payload.workflow_name);
            return AppError::NotFound(format!("workflow '{}' not found", payload.workflow_name))
                .into_response();
        }
        Err(e) => return AppError::from(e).into_response(),
    };

    let context = RequestContext::build(RawRequest {
        method,
        path: uri.path().to_string(),
        path_params: HashMap::new(),
        query: uri.query().map(str::to_string),
        headers,
        body: body.to_vec(),
    });
    let executor = state.dispatcher.workflows().clone();

    isolated(async move {
        let outcome = executor.run(&workflow, &context).await;
        HttpResult::from_run(&outcome).into_response()
    })
    .await
}
