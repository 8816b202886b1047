/// Workflow execution log
///
/// Every workflow run, successful or not, produces one `ExecutionLogEntry` that
/// is appended to an `ExecutionLogSink`. The core never reads entries back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Final status of a run or a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

/// Trace of one node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTrace {
    pub index: i64,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    /// Successor chosen by the node, after defaulting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node: Option<i64>,
    /// Output bindings the node assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Failure summary of an unsuccessful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<i64>,
}

/// One record per workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub execution_id: String,
    pub workflow_id: i64,
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    /// Node executions performed
    pub iterations: u32,
    /// Last node that ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_node: Option<i64>,
    pub nodes: Vec<NodeTrace>,
    /// Final data on success, partial data on failure
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
}

impl ExecutionLogEntry {
    /// File name `<YYYYMMDD_HHMMSS>_<execution id without hyphens>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            self.started_at.format("%Y%m%d_%H%M%S"),
            self.execution_id.replace('-', "")
        )
    }
}

/// Destination for execution log entries
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    async fn append(&self, entry: &ExecutionLogEntry) -> anyhow::Result<()>;
}

/// Writes one pretty-printed JSON file per run into a directory
#[derive(Debug, Clone)]
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[async_trait]
impl ExecutionLogSink for FileLogSink {
    async fn append(&self, entry: &ExecutionLogEntry) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(entry.file_name());
        let content = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&path, content).await?;

        tracing::debug!("📝 Execution log written to {}", path.display());
        Ok(())
    }
}

/// Keeps entries in memory
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<ExecutionLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionLogSink for MemoryLogSink {
    async fn append(&self, entry: &ExecutionLogEntry) -> anyhow::Result<()> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}
