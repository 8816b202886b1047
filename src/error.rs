/// Error taxonomy for the execution core
///
/// Every failure that can reach a client is one of these kinds. Each kind maps to
/// an HTTP status and a structured JSON body, so handlers never surface raw
/// stack traces or panics to the transport layer.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use thiserror::Error;

/// Result alias used by the execution core
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Execution core error
#[derive(Debug, Error)]
pub enum AppError {
    /// Fault raised inside sandboxed code
    #[error("{message}")]
    Script {
        message: String,
        /// Workflow node that raised the fault, when invoked from a workflow
        node: Option<i64>,
    },

    /// Malformed request body or parameters
    #[error("{message}")]
    Validation {
        message: String,
        /// Field-level detail, e.g. `{"title": "required field is missing"}`
        detail: Option<Value>,
    },

    /// Missing record, endpoint or workflow
    #[error("{0}")]
    NotFound(String),

    /// Workflow iteration ceiling reached
    #[error("iteration limit exceeded ({limit} node executions)")]
    LimitExceeded { limit: u32 },

    /// Malformed stored definition
    #[error("{0}")]
    Config(String),

    /// Collaborator backend failure (database, serialization)
    #[error("storage error: {0}")]
    Storage(String),
}

impl AppError {
    pub fn script(message: impl Into<String>) -> Self {
        AppError::Script { message: message.into(), node: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation { message: message.into(), detail: None }
    }

    pub fn validation_with(message: impl Into<String>, detail: Value) -> Self {
        AppError::Validation { message: message.into(), detail: Some(detail) }
    }

    /// Attach the originating workflow node to a script fault
    pub fn at_node(self, index: i64) -> Self {
        match self {
            AppError::Script { message, .. } => AppError::Script { message, node: Some(index) },
            other => other,
        }
    }

    /// Stable kind name exposed as `error_kind`
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Script { .. } => "ScriptError",
            AppError::Validation { .. } => "ValidationError",
            AppError::NotFound(_) => "NotFoundError",
            AppError::LimitExceeded { .. } => "LimitExceededError",
            AppError::Config(_) => "ConfigError",
            AppError::Storage(_) => "StorageError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Script { .. }
            | AppError::LimitExceeded { .. }
            | AppError::Config(_)
            | AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to clients
    ///
    /// Storage failures may carry SQL or file paths, so only their kind is exposed.
    pub fn external_message(&self) -> String {
        match self {
            AppError::Storage(_) => "a storage error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Structured body `{error_kind, message, detail?}`
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "error_kind": self.kind(),
            "message": self.external_message(),
        });

        let detail = match self {
            AppError::Script { node: Some(node), .. } => Some(json!({ "node": node })),
            AppError::Validation { detail, .. } => detail.clone(),
            _ => None,
        };
        if let Some(detail) = detail {
            body["detail"] = detail;
        }

        body
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("not found".to_string()),
            other => AppError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Storage(format!("invalid stored JSON: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Storage(format!("{:#}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Storage(_)) {
            tracing::error!("❌ Storage failure: {}", self);
        }
        (self.status_code(), Json(self.to_json())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::validation("bad").status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::script("boom").status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AppError::LimitExceeded { limit: 1000 }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(AppError::Config("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_script_error_body_carries_node() {
        let body = AppError::script("attempt to index a nil value").at_node(3).to_json();
        assert_eq!(body["error_kind"], "ScriptError");
        assert_eq!(body["message"], "attempt to index a nil value");
        assert_eq!(body["detail"]["node"], 3);
    }

    #[test]
    fn test_storage_message_is_sanitized() {
        let err = AppError::Storage("no such table: records (/var/data/app.db)".into());
        let body = err.to_json();
        assert_eq!(body["error_kind"], "StorageError");
        assert_eq!(body["message"], "a storage error occurred");
        assert!(body.get("detail").is_none());
    }

    #[test]
    fn test_validation_detail() {
        let err = AppError::validation_with("validation failed", json!({"title": "required"}));
        assert_eq!(err.to_json()["detail"]["title"], "required");
    }
}
