/// flowgate: configuration-defined HTTP endpoints
///
/// This library provides the execution core that serves stored endpoint
/// definitions through sandboxed Lua scripts, numbered-node workflows,
/// response templates and a CRUD bridge, with hot-reloadable routing.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Stored endpoint, workflow and data-model definitions
pub mod definition;

// Record store collaborator for crud endpoints
pub mod records;

// Execution core - sandbox, workflow executor, dispatcher
pub mod runtime;

// HTTP API layer - workflow invocation, route reload, dynamic endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use definition::{DataModel, EndpointDefinition, LogicType, WorkflowDefinition, WorkflowNode};
pub use error::{AppError, AppResult};
pub use runtime::{HttpResult, LogicDispatcher, RequestContext, ScriptSandbox, WorkflowExecutor};
pub use server::start_server;
