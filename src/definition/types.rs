/// Stored definition types
///
/// Endpoints, workflows and data models are authored elsewhere and persisted as
/// JSON. The execution core only reads them; these types are the shape it reads.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Execution strategy attached to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicType {
    /// Raw code if present, otherwise the response template
    Simple,
    /// Record-store operation derived from the HTTP verb
    Crud,
    /// Node-graph workflow run
    Workflow,
    /// Raw code whose `result` binding becomes the body
    Custom,
}

impl LogicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicType::Simple => "simple",
            LogicType::Crud => "crud",
            LogicType::Workflow => "workflow",
            LogicType::Custom => "custom",
        }
    }
}

/// A configuration-defined HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub id: i64,
    pub name: String,
    /// Route path, e.g. "/items/{id}"
    pub path: String,
    /// HTTP method, e.g. "GET"
    pub method: String,
    pub logic_type: LogicType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lua source for `simple` and `custom` endpoints
    #[serde(default)]
    pub code: Option<String>,
    /// Response template for `simple` endpoints without code
    #[serde(default)]
    pub response_template: Option<String>,
    /// Data model for `crud` endpoints
    #[serde(default)]
    pub model_id: Option<i64>,
    /// Workflow for `workflow` endpoints
    #[serde(default)]
    pub workflow_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A numbered-node workflow
///
/// Nodes run starting at index 1; each node picks its successor through the
/// `next_node` binding. Connections are kept for the authoring layer only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub connections: Vec<WorkflowConnection>,
}

/// One unit of script execution within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Execution index, always >= 1
    pub index: i64,
    /// Human label, exposed to scripts as `node_name`
    pub name: String,
    /// Lua source
    pub code: String,
}

/// Edge drawn between two nodes in the authoring canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConnection {
    pub source: String,
    pub target: String,
}

impl WorkflowDefinition {
    /// Look up a node by execution index
    pub fn node(&self, index: i64) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.index == index)
    }

    /// Check the structural rules the executor relies on
    ///
    /// Node indexes must be positive and unique, and node 1 must exist.
    pub fn validate(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.index <= 0 {
                return Err(AppError::Config(format!(
                    "workflow '{}' has node '{}' with reserved index {}",
                    self.name, node.name, node.index
                )));
            }
            if !seen.insert(node.index) {
                return Err(AppError::Config(format!(
                    "workflow '{}' has duplicate node index {}",
                    self.name, node.index
                )));
            }
        }

        if !seen.contains(&1) {
            return Err(AppError::Config(format!("workflow '{}' has no node 1", self.name)));
        }

        Ok(())
    }
}

/// User-defined record schema backing `crud` endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataModel {
    pub id: i64,
    pub name: String,
    pub table_name: String,
    pub fields: Vec<ModelField>,
}

/// A single field of a data model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelField {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Field value types understood by the CRUD bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Integer,
    Float,
    Boolean,
    /// RFC 3339 timestamp string
    Datetime,
    /// Any JSON value
    Json,
}

impl DataModel {
    pub fn field(&self, name: &str) -> Option<&ModelField> {
        self.fields.iter().find(|field| field.name == name)
    }
}

fn default_enabled() -> bool {
    true
}
