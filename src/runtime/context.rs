/// Request context builder
///
/// Turns a raw HTTP request into the immutable `RequestContext` every logic type
/// consumes. Building never fails: malformed input degrades to `null` values.

use axum::http::{header, HeaderMap, Method};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Raw request parts handed to the builder
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    /// Request path without query string
    pub path: String,
    /// Parameters captured by the matched route pattern
    pub path_params: HashMap<String, String>,
    /// Raw query string, without the leading `?`
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Immutable per-request snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub method: String,
    pub uri: String,
    pub path: Map<String, Value>,
    pub query: Map<String, Value>,
    /// Parsed JSON, raw text for non-JSON content, or null
    pub body: Value,
    /// Original text when the body was declared JSON but failed to parse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    /// Header names are lower-cased
    pub headers: Map<String, Value>,
}

impl RequestContext {
    /// Build the context for one request
    pub fn build(raw: RawRequest) -> Self {
        let path = raw
            .path_params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let query = url::form_urlencoded::parse(raw.query.unwrap_or_default().as_bytes())
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect();

        // Repeated headers are joined in arrival order
        let mut headers = Map::new();
        for name in raw.headers.keys() {
            let joined = raw
                .headers
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            headers.insert(name.as_str().to_ascii_lowercase(), Value::String(joined));
        }

        let (body, body_text) = parse_body(&raw.headers, &raw.body);

        Self {
            method: raw.method.as_str().to_string(),
            uri: raw.path,
            path,
            query,
            body,
            body_text,
            headers,
        }
    }

    /// Context as a script binding: `{path, query, body, headers}` plus request line
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Request summary bound as `request` inside scripts
    pub fn request_value(&self) -> Value {
        json!({
            "method": self.method,
            "path": self.uri,
            "query": self.query,
            "headers": self.headers,
        })
    }

    /// Named sub-map used by template lookups
    pub fn section(&self, name: &str) -> Option<Value> {
        match name {
            "path" => Some(Value::Object(self.path.clone())),
            "query" => Some(Value::Object(self.query.clone())),
            "headers" => Some(Value::Object(self.headers.clone())),
            "body" => Some(self.body.clone()),
            _ => None,
        }
    }
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Decode the body according to its declared content type
fn parse_body(headers: &HeaderMap, bytes: &[u8]) -> (Value, Option<String>) {
    if bytes.is_empty() {
        return (Value::Null, None);
    }

    let text = String::from_utf8_lossy(bytes).into_owned();
    if !is_json_content_type(headers) {
        return (Value::String(text), None);
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => (value, None),
        Err(e) => {
            tracing::debug!("⚠️ Malformed JSON body kept as text: {}", e);
            (Value::Null, Some(text))
        }
    }
}
