/// Execution core
///
/// Everything that turns a matched request into a response:
/// - Request context building and template rendering
/// - Lua script sandbox with an allow-listed capability table and optional databases
/// - Numbered-node workflow executor with execution logging
/// - CRUD bridge onto the record store
/// - Logic dispatcher routing endpoints to the strategies above

// Immutable per-request snapshot
pub mod context;

// `{{context.*}}` placeholder substitution
pub mod template;

// Per-call Lua interpreter and output binding extraction
pub mod sandbox;

// Functions and libraries reachable from scripts
pub mod capabilities;

// SQLite handles reachable through the `db` capability
pub mod databases;

// HTTP verb to record store mapping
pub mod crud;

// Node-graph execution state machine
pub mod workflow;

// Execution log entries and sinks
pub mod log;

// Strategy routing and response normalization
pub mod dispatcher;

// Re-export main types
pub use context::{RawRequest, RequestContext};
pub use crud::CrudBridge;
pub use databases::{ScriptDatabase, ScriptDatabases};
pub use dispatcher::{HttpResult, LogicDispatcher};
pub use log::{ExecutionLogEntry, ExecutionLogSink, FileLogSink, MemoryLogSink};
pub use sandbox::{SandboxLimits, ScriptOutputs, ScriptSandbox};
pub use workflow::{ExecutionState, RunOutcome, Termination, WorkflowExecutor};
