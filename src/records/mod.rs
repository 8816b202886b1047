/// Record store collaborator
///
/// The CRUD bridge validates request shape and maps HTTP semantics; the actual
/// storage of user-defined model data happens behind the `RecordStore` trait.

use crate::{definition::DataModel, error::AppResult};
use async_trait::async_trait;
use serde_json::{Map, Value};

// SQLite adapter storing records as JSON documents
pub mod sqlite;

pub use sqlite::SqliteRecordStore;

/// A stored record: numeric id plus a JSON object of field values
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub fields: Map<String, Value>,
}

impl Record {
    /// Flat JSON form `{"id": .., <fields>}`
    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::from(self.id));
        Value::Object(object)
    }
}

/// One page of a record listing
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub items: Vec<Record>,
    /// Matching records across all pages
    pub total: u64,
}

/// Storage operations available to `crud` endpoints
///
/// Implementations report missing records as `AppError::NotFound` and rejected
/// values as `AppError::Validation`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Equality-filtered, 1-based paginated listing
    async fn query(
        &self,
        model: &DataModel,
        filter: &Map<String, Value>,
        page: u32,
        page_size: u32,
    ) -> AppResult<RecordPage>;

    async fn get(&self, model: &DataModel, id: i64) -> AppResult<Record>;

    async fn create(&self, model: &DataModel, fields: Map<String, Value>) -> AppResult<Record>;

    async fn update(&self, model: &DataModel, id: i64, fields: Map<String, Value>) -> AppResult<Record>;

    async fn delete(&self, model: &DataModel, id: i64) -> AppResult<()>;
}
