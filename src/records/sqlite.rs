/// SQLite record store
///
/// All models share one `records` table keyed by the model's table name; field
/// values live in a JSON column and filters use `json_extract`.

use crate::{
    definition::DataModel,
    error::{AppError, AppResult},
    records::{Record, RecordPage, RecordStore},
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqlitePool},
    Row, Sqlite,
};

/// SQLite-backed record store
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the records table. Safe to call multiple times.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model TEXT NOT NULL,
                fields JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_model ON records(model)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

/// Build the WHERE clause for a model plus equality filter
///
/// Field names end up inside a JSON path literal, so only `[A-Za-z0-9_]` is allowed.
fn filter_clause(filter: &Map<String, Value>) -> AppResult<String> {
    let mut clause = String::from("model = ?");

    for (field, value) in filter {
        if field.is_empty() || !field.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(AppError::validation(format!("invalid filter field: {}", field)));
        }
        if value.is_null() {
            clause.push_str(&format!(" AND json_extract(fields, '$.{}') IS NULL", field));
        } else {
            clause.push_str(&format!(" AND json_extract(fields, '$.{}') = ?", field));
        }
    }

    Ok(clause)
}

/// Bind one filter value the way `json_extract` returns it
fn bind_filter_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query,
        Value::String(s) => query.bind(s.as_str()),
        Value::Bool(b) => query.bind(if *b { 1i64 } else { 0i64 }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        other => query.bind(other.to_string()),
    }
}

fn decode_record(id: i64, fields_json: &str) -> AppResult<Record> {
    match serde_json::from_str(fields_json)? {
        Value::Object(fields) => Ok(Record { id, fields }),
        _ => Err(AppError::Storage(format!("record {} does not hold a JSON object", id))),
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn query(
        &self,
        model: &DataModel,
        filter: &Map<String, Value>,
        page: u32,
        page_size: u32,
    ) -> AppResult<RecordPage> {
        let clause = filter_clause(filter)?;

        let count_sql = format!("SELECT COUNT(*) AS total FROM records WHERE {}", clause);
        let mut count_query = sqlx::query(&count_sql).bind(model.table_name.as_str());
        for value in filter.values() {
            count_query = bind_filter_value(count_query, value);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("total");

        let list_sql = format!(
            "SELECT id, fields FROM records WHERE {} ORDER BY id LIMIT ? OFFSET ?",
            clause
        );
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let mut list_query = sqlx::query(&list_sql).bind(model.table_name.as_str());
        for value in filter.values() {
            list_query = bind_filter_value(list_query, value);
        }
        let rows = list_query
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let fields_json: String = row.get("fields");
            items.push(decode_record(id, &fields_json)?);
        }

        tracing::debug!("📖 Listed {} of {} records from '{}'", items.len(), total, model.table_name);

        Ok(RecordPage { items, total: total.max(0) as u64 })
    }

    async fn get(&self, model: &DataModel, id: i64) -> AppResult<Record> {
        let row = sqlx::query("SELECT id, fields FROM records WHERE model = ? AND id = ?")
            .bind(&model.table_name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("record {} not found in '{}'", id, model.name)))?;

        let fields_json: String = row.get("fields");
        decode_record(id, &fields_json)
    }

    async fn create(&self, model: &DataModel, fields: Map<String, Value>) -> AppResult<Record> {
        let fields_json = serde_json::to_string(&fields)?;

        let result = sqlx::query("INSERT INTO records (model, fields) VALUES (?, ?)")
            .bind(&model.table_name)
            .bind(&fields_json)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        tracing::info!("✅ Created record {} in '{}'", id, model.table_name);

        Ok(Record { id, fields })
    }

    async fn update(&self, model: &DataModel, id: i64, fields: Map<String, Value>) -> AppResult<Record> {
        let fields_json = serde_json::to_string(&fields)?;

        let result = sqlx::query(
            "UPDATE records SET fields = ?, updated_at = CURRENT_TIMESTAMP WHERE model = ? AND id = ?",
        )
        .bind(&fields_json)
        .bind(&model.table_name)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("record {} not found in '{}'", id, model.name)));
        }

        Ok(Record { id, fields })
    }

    async fn delete(&self, model: &DataModel, id: i64) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM records WHERE model = ? AND id = ?")
            .bind(&model.table_name)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("record {} not found in '{}'", id, model.name)));
        }

        tracing::info!("🗑️ Deleted record {} from '{}'", id, model.table_name);
        Ok(())
    }
}
