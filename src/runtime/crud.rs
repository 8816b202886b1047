/// CRUD bridge
///
/// Maps a `crud` endpoint's HTTP verb and request context onto one record store
/// call, validating request shape against the endpoint's data model first.

use crate::{
    definition::{DataModel, FieldType},
    error::{AppError, AppResult},
    records::RecordStore,
    runtime::{context::RequestContext, dispatcher::HttpResult},
};
use axum::http::{Method, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Query parameters reserved for paging
const PAGING_PARAMS: [&str; 2] = ["page", "page_size"];

/// Translates HTTP semantics into record store operations
#[derive(Clone)]
pub struct CrudBridge {
    store: Arc<dyn RecordStore>,
    default_page_size: u32,
    max_page_size: u32,
}

impl CrudBridge {
    pub fn new(store: Arc<dyn RecordStore>, default_page_size: u32, max_page_size: u32) -> Self {
        Self {
            store,
            default_page_size: default_page_size.max(1),
            max_page_size: max_page_size.max(1),
        }
    }

    /// Handle one request against `model`
    pub async fn handle(&self, method: &Method, model: &DataModel, context: &RequestContext) -> HttpResult {
        match self.try_handle(method, model, context).await {
            Ok(result) => result,
            Err(AppError::NotFound(message)) => {
                tracing::debug!("🔍 {}", message);
                HttpResult::new(StatusCode::NOT_FOUND, json!({"error": "not found"}))
            }
            Err(error) => HttpResult::from_error(&error),
        }
    }

    async fn try_handle(&self, method: &Method, model: &DataModel, context: &RequestContext) -> AppResult<HttpResult> {
        let id = record_id(context)?;

        match (method.as_str(), id) {
            ("GET", Some(id)) => {
                let record = self.store.get(model, id).await?;
                Ok(HttpResult::ok(record.to_json()))
            }
            ("GET", None) => self.list(model, context).await,
            ("POST", _) => {
                let fields = validate_fields(model, &context.body)?;
                let record = self.store.create(model, fields).await?;
                Ok(HttpResult::new(StatusCode::CREATED, record.to_json()))
            }
            ("PUT", Some(id)) => {
                let fields = validate_fields(model, &context.body)?;
                let record = self.store.update(model, id, fields).await?;
                Ok(HttpResult::ok(record.to_json()))
            }
            ("DELETE", Some(id)) => {
                self.store.delete(model, id).await?;
                Ok(HttpResult::empty(StatusCode::NO_CONTENT))
            }
            ("PUT", None) | ("DELETE", None) => Err(AppError::validation("record id is required")),
            (other, _) => Ok(HttpResult::new(
                StatusCode::METHOD_NOT_ALLOWED,
                json!({"error": format!("method {} not allowed", other)}),
            )),
        }
    }

    async fn list(&self, model: &DataModel, context: &RequestContext) -> AppResult<HttpResult> {
        let page = paging_param(&context.query, "page")?.unwrap_or(1).max(1);
        let page_size = paging_param(&context.query, "page_size")?
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size);
        let filter = query_filter(model, &context.query)?;

        let result = self.store.query(model, &filter, page, page_size).await?;
        let items: Vec<Value> = result.items.iter().map(|r| r.to_json()).collect();

        Ok(HttpResult::ok(json!({
            "items": items,
            "total": result.total,
            "page": page,
            "page_size": page_size,
        })))
    }
}

/// Parse the `id` path parameter, if the route has one
fn record_id(context: &RequestContext) -> AppResult<Option<i64>> {
    match context.path.get("id") {
        None => Ok(None),
        Some(Value::String(raw)) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| AppError::validation(format!("record id must be an integer, got '{}'", raw))),
        Some(other) => Err(AppError::validation(format!("record id must be an integer, got {}", other))),
    }
}

/// Read a paging parameter; negative values saturate to zero
fn paging_param(query: &Map<String, Value>, name: &str) -> AppResult<Option<u32>> {
    let Some(raw) = query.get(name).and_then(Value::as_str) else {
        return Ok(None);
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| AppError::validation(format!("{} must be an integer, got '{}'", name, raw)))?;
    Ok(Some(value.clamp(0, i64::from(u32::MAX)) as u32))
}

/// Query parameters naming model fields become an equality filter
fn query_filter(model: &DataModel, query: &Map<String, Value>) -> AppResult<Map<String, Value>> {
    let mut filter = Map::new();
    for (name, raw) in query {
        if PAGING_PARAMS.contains(&name.as_str()) {
            continue;
        }
        let (Some(field), Some(raw)) = (model.field(name), raw.as_str()) else {
            continue;
        };
        let value = coerce_query_value(field.field_type, raw).ok_or_else(|| {
            AppError::validation_with(
                "invalid filter value",
                json!({ name.clone(): format!("expected {}", type_name(field.field_type)) }),
            )
        })?;
        filter.insert(name.clone(), value);
    }
    Ok(filter)
}

fn coerce_query_value(field_type: FieldType, raw: &str) -> Option<Value> {
    match field_type {
        FieldType::String | FieldType::Text | FieldType::Datetime => Some(Value::String(raw.to_string())),
        FieldType::Integer => raw.parse::<i64>().ok().map(Value::from),
        FieldType::Float => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        FieldType::Json => Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))),
    }
}

fn type_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "string",
        FieldType::Text => "text",
        FieldType::Integer => "integer",
        FieldType::Float => "float",
        FieldType::Boolean => "boolean",
        FieldType::Datetime => "datetime",
        FieldType::Json => "json",
    }
}

fn matches_type(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String | FieldType::Text => value.is_string(),
        FieldType::Integer => value.is_i64(),
        FieldType::Float => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Datetime => value
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        FieldType::Json => true,
    }
}

/// Check a create/update body against the model
///
/// Collects every problem into a field-level detail map.
fn validate_fields(model: &DataModel, body: &Value) -> AppResult<Map<String, Value>> {
    let Value::Object(input) = body else {
        return Err(AppError::validation("request body must be a JSON object"));
    };

    let mut problems = Map::new();
    for name in input.keys() {
        if model.field(name).is_none() && name != "id" {
            problems.insert(name.clone(), json!("unknown field"));
        }
    }

    let mut fields = Map::new();
    for field in &model.fields {
        match input.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                problems.insert(field.name.clone(), json!("required field is missing"));
            }
            None => {}
            Some(Value::Null) => {
                fields.insert(field.name.clone(), Value::Null);
            }
            Some(value) if matches_type(field.field_type, value) => {
                fields.insert(field.name.clone(), value.clone());
            }
            Some(_) => {
                problems.insert(
                    field.name.clone(),
                    json!(format!("expected {}", type_name(field.field_type))),
                );
            }
        }
    }

    if problems.is_empty() {
        Ok(fields)
    } else {
        Err(AppError::validation_with("validation failed", Value::Object(problems)))
    }
}
