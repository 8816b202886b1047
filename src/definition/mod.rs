/// Definition Layer
///
/// Stored endpoint, workflow and data-model definitions and the storage
/// collaborator the execution core reads them through:
/// - Type definitions (EndpointDefinition, WorkflowDefinition, DataModel)
/// - SQLite persistence with sqlx, plus an in-memory store

// Core definition types
pub mod types;

// Storage collaborator trait and adapters
pub mod storage;

// Re-export commonly used types
pub use storage::{DefinitionStore, MemoryDefinitionStore, SqliteDefinitionStore};
pub use types::{
    DataModel, EndpointDefinition, FieldType, LogicType, ModelField, WorkflowConnection,
    WorkflowDefinition, WorkflowNode,
};
