/// Script database handles
///
/// Named SQLite pools scripts can query through the `db` capability. The first
/// configured database is also bound as `db`. Statements take positional `?`
/// parameters; rows come back as JSON objects keyed by column name.

use crate::config::ScriptDatabaseConfig;
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqlitePool, SqliteRow},
    Column, Row, Sqlite, TypeInfo, ValueRef,
};
use std::sync::Arc;

/// One named pool
#[derive(Debug, Clone)]
pub struct ScriptDatabase {
    pub name: String,
    pub pool: SqlitePool,
}

/// Databases exposed to scripts; empty means the capability is off
#[derive(Debug, Clone, Default)]
pub struct ScriptDatabases {
    entries: Arc<Vec<ScriptDatabase>>,
}

impl ScriptDatabases {
    pub fn new(entries: Vec<ScriptDatabase>) -> Self {
        Self { entries: Arc::new(entries) }
    }

    /// Open every configured database
    pub async fn connect(configs: &[ScriptDatabaseConfig]) -> Result<Self> {
        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            tracing::info!("🗄️ Opening script database '{}': {}", config.name, config.path);
            let pool = crate::server::connect_database(&config.path).await?;
            entries.push(ScriptDatabase { name: config.name.clone(), pool });
        }
        Ok(Self::new(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptDatabase> {
        self.entries.iter()
    }

    /// Database bound as `db`
    pub fn default_database(&self) -> Option<&ScriptDatabase> {
        self.entries.first()
    }
}

fn bind_param<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Decode a row by the storage class of each value
fn row_to_json(row: &SqliteRow) -> Result<Value> {
    let mut object = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let class = raw.type_info().name().to_string();
            match class.as_str() {
                "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(i)?),
                "REAL" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(i)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(STANDARD.encode(row.try_get_unchecked::<Vec<u8>, _>(i)?)),
                _ => Value::String(row.try_get_unchecked::<String, _>(i)?),
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

/// Run a statement returning rows
pub async fn query(pool: &SqlitePool, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
    let mut statement = sqlx::query(sql);
    for value in params {
        statement = bind_param(statement, value);
    }
    let rows = statement.fetch_all(pool).await?;
    rows.iter().map(row_to_json).collect()
}

/// Run a statement and return the number of affected rows
pub async fn execute(pool: &SqlitePool, sql: &str, params: &[Value]) -> Result<u64> {
    let mut statement = sqlx::query(sql);
    for value in params {
        statement = bind_param(statement, value);
    }
    Ok(statement.execute(pool).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_and_query_with_params() {
        let pool = memory_pool().await;
        execute(&pool, "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT, score REAL, raw BLOB)", &[])
            .await
            .unwrap();

        let inserted = execute(
            &pool,
            "INSERT INTO notes (body, score, raw) VALUES (?, ?, ?), (?, ?, ?)",
            &[json!("a"), json!(1.5), Value::Null, json!("b"), json!(2), Value::Null],
        )
        .await
        .unwrap();
        assert_eq!(inserted, 2);

        let rows = query(&pool, "SELECT id, body, score, raw FROM notes WHERE body = ?", &[json!("a")])
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"id": 1, "body": "a", "score": 1.5, "raw": null})]);

        let counted = query(&pool, "SELECT count(*) AS n FROM notes", &[]).await.unwrap();
        assert_eq!(counted[0]["n"], 2);
    }

    #[tokio::test]
    async fn test_invalid_sql_is_an_error() {
        let pool = memory_pool().await;
        assert!(query(&pool, "SELEKT 1", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_first_database_is_the_default() {
        assert!(ScriptDatabases::default().is_empty());
        assert!(ScriptDatabases::default().default_database().is_none());

        let databases = ScriptDatabases::new(vec![
            ScriptDatabase { name: "main".to_string(), pool: memory_pool().await },
            ScriptDatabase { name: "audit".to_string(), pool: memory_pool().await },
        ]);
        assert_eq!(databases.default_database().map(|d| d.name.as_str()), Some("main"));
        assert_eq!(databases.iter().count(), 2);
    }
}
