/// Definition storage collaborator
///
/// The execution core reads endpoint, workflow and data-model definitions through
/// the `DefinitionStore` trait. `SqliteDefinitionStore` persists them as JSON in
/// SQLite; `MemoryDefinitionStore` keeps them in process for tests and embedding.

use crate::definition::types::{DataModel, EndpointDefinition, WorkflowDefinition};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Read-side interface the core needs from definition storage
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// All endpoints with `enabled = true`, in id order
    async fn list_enabled_endpoints(&self) -> Result<Vec<EndpointDefinition>>;

    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowDefinition>>;

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>>;

    async fn get_data_model(&self, id: i64) -> Result<Option<DataModel>>;
}

/// SQLite-based definition storage
///
/// Definitions live in JSON columns; indexed columns hold the fields used for
/// lookups (enabled flag, workflow name).
#[derive(Debug, Clone)]
pub struct SqliteDefinitionStore {
    pool: SqlitePool,
}

impl SqliteDefinitionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create definition tables. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS endpoints (
                id INTEGER PRIMARY KEY,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                definition JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                definition JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS data_models (
                id INTEGER PRIMARY KEY,
                definition JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_endpoints_enabled ON endpoints(enabled)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert or replace an endpoint definition
    pub async fn save_endpoint(&self, endpoint: &EndpointDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(endpoint)?;

        sqlx::query(
            r#"
            INSERT INTO endpoints (id, method, path, enabled, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                method = excluded.method,
                path = excluded.path,
                enabled = excluded.enabled,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.method)
        .bind(&endpoint.path)
        .bind(endpoint.enabled)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a workflow definition
    pub async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a data model definition
    pub async fn save_data_model(&self, model: &DataModel) -> Result<()> {
        let definition_json = serde_json::to_string(model)?;

        sqlx::query(
            r#"
            INSERT INTO data_models (id, definition, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(model.id)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Decode the `definition` JSON column of an optional row
fn decode_definition<T: serde::de::DeserializeOwned>(row: Option<SqliteRow>) -> Result<Option<T>> {
    match row {
        Some(row) => {
            let definition_json: String = row.get("definition");
            Ok(Some(serde_json::from_str(&definition_json)?))
        }
        None => Ok(None),
    }
}

#[async_trait]
impl DefinitionStore for SqliteDefinitionStore {
    /// Rows whose definition no longer decodes are skipped with a warning
    async fn list_enabled_endpoints(&self) -> Result<Vec<EndpointDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM endpoints WHERE enabled = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut endpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let definition_json: String = row.get("definition");
            match serde_json::from_str(&definition_json) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => tracing::warn!("⚠️ Skipping endpoint {}: malformed definition ({})", id, e),
            }
        }

        Ok(endpoints)
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        decode_definition(row)
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        decode_definition(row)
    }

    async fn get_data_model(&self, id: i64) -> Result<Option<DataModel>> {
        let row = sqlx::query("SELECT definition FROM data_models WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        decode_definition(row)
    }
}

/// In-process definition storage
#[derive(Debug, Default)]
pub struct MemoryDefinitionStore {
    endpoints: RwLock<Vec<EndpointDefinition>>,
    workflows: RwLock<HashMap<i64, WorkflowDefinition>>,
    models: RwLock<HashMap<i64, DataModel>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an endpoint by id
    pub async fn put_endpoint(&self, endpoint: EndpointDefinition) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.retain(|existing| existing.id != endpoint.id);
        endpoints.push(endpoint);
        endpoints.sort_by_key(|e| e.id);
    }

    pub async fn remove_endpoint(&self, id: i64) {
        self.endpoints.write().await.retain(|existing| existing.id != id);
    }

    pub async fn put_workflow(&self, workflow: WorkflowDefinition) {
        self.workflows.write().await.insert(workflow.id, workflow);
    }

    pub async fn put_data_model(&self, model: DataModel) {
        self.models.write().await.insert(model.id, model);
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn list_enabled_endpoints(&self) -> Result<Vec<EndpointDefinition>> {
        Ok(self.endpoints.read().await.iter().filter(|e| e.enabled).cloned().collect())
    }

    async fn get_workflow(&self, id: i64) -> Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().await.values().find(|w| w.name == name).cloned())
    }

    async fn get_data_model(&self, id: i64) -> Result<Option<DataModel>> {
        Ok(self.models.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::types::{LogicType, WorkflowNode};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn endpoint(id: i64, path: &str, enabled: bool) -> EndpointDefinition {
        EndpointDefinition {
            id,
            name: format!("ep-{}", id),
            path: path.to_string(),
            method: "GET".to_string(),
            logic_type: LogicType::Simple,
            enabled,
            code: None,
            response_template: Some("ok".to_string()),
            model_id: None,
            workflow_id: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_sqlite_lists_only_enabled_endpoints() {
        let store = SqliteDefinitionStore::new(memory_pool().await);
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();

        store.save_endpoint(&endpoint(2, "/b", true)).await.unwrap();
        store.save_endpoint(&endpoint(1, "/a", true)).await.unwrap();
        store.save_endpoint(&endpoint(3, "/c", false)).await.unwrap();

        let endpoints = store.list_enabled_endpoints().await.unwrap();
        let paths: Vec<_> = endpoints.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/b"]);

        // Upsert disables an endpoint in place
        store.save_endpoint(&endpoint(1, "/a", false)).await.unwrap();
        assert_eq!(store.list_enabled_endpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_skips_undecodable_endpoint_rows() {
        let store = SqliteDefinitionStore::new(memory_pool().await);
        store.init_schema().await.unwrap();
        store.save_endpoint(&endpoint(1, "/a", true)).await.unwrap();
        sqlx::query("INSERT INTO endpoints (id, method, path, enabled, definition) VALUES (2, 'GET', '/b', 1, '{broken')")
            .execute(&store.pool)
            .await
            .unwrap();

        let endpoints = store.list_enabled_endpoints().await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].path, "/a");
    }

    #[tokio::test]
    async fn test_sqlite_workflow_lookup_by_id_and_name() {
        let store = SqliteDefinitionStore::new(memory_pool().await);
        store.init_schema().await.unwrap();

        let workflow = WorkflowDefinition {
            id: 10,
            name: "demo".to_string(),
            enabled: true,
            description: None,
            nodes: vec![WorkflowNode { index: 1, name: "start".into(), code: "next_node = 0".into() }],
            connections: vec![],
        };
        store.save_workflow(&workflow).await.unwrap();

        let by_id = store.get_workflow(10).await.unwrap().unwrap();
        assert_eq!(by_id.name, "demo");
        let by_name = store.get_workflow_by_name("demo").await.unwrap().unwrap();
        assert_eq!(by_name.nodes.len(), 1);
        assert!(store.get_workflow_by_name("other").await.unwrap().is_none());
        assert!(store.get_data_model(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_replaces_by_id() {
        let store = MemoryDefinitionStore::new();
        store.put_endpoint(endpoint(1, "/a", true)).await;
        store.put_endpoint(endpoint(1, "/a2", true)).await;
        store.put_endpoint(endpoint(2, "/b", false)).await;

        let endpoints = store.list_enabled_endpoints().await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].path, "/a2");
    }
}
