/// Numbered-node workflow executor
///
/// A run starts at node 1 with `data = {}` and threads `data` from node to node.
/// After each node the transition function reads the node's `next_node` binding:
/// a value <= 0 ends the run successfully, any other value names the next node.
/// The iteration ceiling turns runaway loops into a `LimitExceeded` failure.

use crate::{
    definition::{WorkflowDefinition, WorkflowNode},
    error::{AppError, AppResult},
    runtime::{
        context::RequestContext,
        log::{ExecutionLogEntry, ExecutionLogSink, NodeTrace, RunFailure, RunStatus},
        sandbox::{ScriptOutputs, ScriptSandbox},
    },
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Instant};

/// Mutable state of one run; owned by a single task
#[derive(Debug, Clone)]
pub struct ExecutionState {
    /// Node currently executing, or the last one that ran
    pub current: i64,
    pub data: Value,
    /// Node executions so far
    pub iterations: u32,
    pub trace: Vec<NodeTrace>,
}

impl ExecutionState {
    fn new() -> Self {
        Self {
            current: 1,
            data: Value::Object(Map::new()),
            iterations: 0,
            trace: Vec::new(),
        }
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Termination {
    Completed,
    Failed(AppError),
}

/// Result of a workflow run
#[derive(Debug)]
pub struct RunOutcome {
    pub execution_id: String,
    pub termination: Termination,
    /// Final data on success, partial data on failure
    pub data: Value,
    pub iterations: u32,
    /// Node the run ended on
    pub node: i64,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.termination, Termination::Completed)
    }

    /// Error body `{error_kind, message, detail: {node, data, execution_id}}`
    pub fn error_body(&self) -> Option<Value> {
        match &self.termination {
            Termination::Completed => None,
            Termination::Failed(error) => Some(json!({
                "error_kind": error.kind(),
                "message": error.external_message(),
                "detail": {
                    "node": self.node,
                    "data": self.data,
                    "execution_id": self.execution_id,
                },
            })),
        }
    }
}

/// Transition function: successor index chosen by a node
///
/// A missing `next_node` means "the following index". Integral floats are
/// accepted; anything else is a script fault. The last representable index
/// has no successor.
pub fn next_index(current: i64, outputs: &ScriptOutputs) -> AppResult<i64> {
    match &outputs.next_node {
        None | Some(Value::Null) => current
            .checked_add(1)
            .ok_or_else(|| AppError::Config(format!("node {} has no following index", current))),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                    _ => Err(AppError::script(format!("next_node must be an integer, got {}", n))),
                }
            }
        }
        Some(other) => Err(AppError::script(format!("next_node must be an integer, got {}", other))),
    }
}

/// Data carried to the next node: `data`, then `result`, then `response`
pub fn carried_data(outputs: &ScriptOutputs) -> Option<Value> {
    outputs
        .data
        .clone()
        .or_else(|| outputs.result.clone())
        .or_else(|| outputs.response.clone())
}

/// Runs workflows through the script sandbox
#[derive(Clone)]
pub struct WorkflowExecutor {
    sandbox: ScriptSandbox,
    log_sink: Arc<dyn ExecutionLogSink>,
    max_iterations: u32,
}

impl WorkflowExecutor {
    pub fn new(sandbox: ScriptSandbox, log_sink: Arc<dyn ExecutionLogSink>, max_iterations: u32) -> Self {
        Self { sandbox, log_sink, max_iterations }
    }

    /// Run `workflow` to completion and append its log entry
    pub async fn run(&self, workflow: &WorkflowDefinition, context: &RequestContext) -> RunOutcome {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let timer = Instant::now();

        tracing::info!(
            "🚀 Starting workflow '{}' (id: {}, execution: {})",
            workflow.name,
            workflow.id,
            execution_id
        );

        let mut state = ExecutionState::new();
        let termination = match workflow.validate() {
            Ok(()) => self.drive(workflow, context, &mut state).await,
            Err(error) => Termination::Failed(error),
        };

        let duration_ms = timer.elapsed().as_millis() as u64;
        match &termination {
            Termination::Completed => tracing::info!(
                "🎉 Workflow '{}' completed after {} node(s) in {}ms",
                workflow.name,
                state.iterations,
                duration_ms
            ),
            Termination::Failed(error) => tracing::error!(
                "❌ Workflow '{}' failed at node {}: {} ({})",
                workflow.name,
                state.current,
                error,
                error.kind()
            ),
        }

        let entry = ExecutionLogEntry {
            execution_id: execution_id.clone(),
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            request_method: Some(context.method.clone()),
            request_path: Some(context.uri.clone()),
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            status: match termination {
                Termination::Completed => RunStatus::Success,
                Termination::Failed(_) => RunStatus::Error,
            },
            iterations: state.iterations,
            final_node: state.trace.last().map(|t| t.index),
            nodes: state.trace,
            data: state.data.clone(),
            error: match &termination {
                Termination::Completed => None,
                Termination::Failed(error) => Some(RunFailure {
                    kind: error.kind().to_string(),
                    message: error.to_string(),
                    node: Some(state.current),
                }),
            },
        };
        if let Err(e) = self.log_sink.append(&entry).await {
            tracing::warn!("⚠️ Failed to write execution log {}: {:#}", execution_id, e);
        }

        RunOutcome {
            execution_id,
            termination,
            data: state.data,
            iterations: state.iterations,
            node: state.current,
        }
    }

    /// Step loop; returns once the run reaches a terminal state
    async fn drive(
        &self,
        workflow: &WorkflowDefinition,
        context: &RequestContext,
        state: &mut ExecutionState,
    ) -> Termination {
        let context_value = context.to_value();
        let request_value = context.request_value();

        loop {
            let Some(node) = workflow.node(state.current) else {
                return Termination::Failed(AppError::Config(format!(
                    "workflow '{}': node {} not found",
                    workflow.name, state.current
                )));
            };
            if node.code.trim().is_empty() {
                return Termination::Failed(AppError::Config(format!(
                    "workflow '{}': node {} has no code",
                    workflow.name, node.index
                )));
            }

            state.iterations += 1;
            let next = match self.step(node, &context_value, &request_value, state).await {
                Ok(next) => next,
                Err(error) => return Termination::Failed(error.at_node(node.index)),
            };

            if next <= 0 {
                return Termination::Completed;
            }
            if state.iterations >= self.max_iterations {
                return Termination::Failed(AppError::LimitExceeded { limit: self.max_iterations });
            }
            state.current = next;
        }
    }

    /// Execute one node and fold its outputs into the state
    async fn step(
        &self,
        node: &WorkflowNode,
        context_value: &Value,
        request_value: &Value,
        state: &mut ExecutionState,
    ) -> AppResult<i64> {
        let mut bindings = Map::new();
        bindings.insert("data".to_string(), state.data.clone());
        bindings.insert("context".to_string(), context_value.clone());
        bindings.insert("request".to_string(), request_value.clone());
        bindings.insert("node".to_string(), Value::from(node.index));
        bindings.insert("node_name".to_string(), Value::String(node.name.clone()));

        tracing::debug!("📍 Executing node {} ('{}'), iteration {}", node.index, node.name, state.iterations);

        let started_at = Utc::now();
        let timer = Instant::now();
        let outcome = self
            .sandbox
            .run(&node.code, bindings)
            .await
            .and_then(|outputs| next_index(node.index, &outputs).map(|next| (outputs, next)));
        let duration_ms = timer.elapsed().as_millis() as u64;

        match outcome {
            Ok((outputs, next)) => {
                if let Some(data) = carried_data(&outputs) {
                    state.data = data;
                }
                state.trace.push(NodeTrace {
                    index: node.index,
                    name: node.name.clone(),
                    started_at,
                    duration_ms,
                    status: RunStatus::Success,
                    next_node: Some(next),
                    output: Some(outputs.to_json()),
                    error: None,
                });
                tracing::debug!("✅ Node {} done in {}ms, next: {}", node.index, duration_ms, next);
                Ok(next)
            }
            Err(error) => {
                state.trace.push(NodeTrace {
                    index: node.index,
                    name: node.name.clone(),
                    started_at,
                    duration_ms,
                    status: RunStatus::Error,
                    next_node: None,
                    output: None,
                    error: Some(error.to_string()),
                });
                Err(error)
            }
        }
    }
}
