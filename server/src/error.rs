use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid endpoint name: {0:?}")]
    InvalidName(String),

    #[error("endpoint {0} already exists")]
    DuplicateName(String),

    #[error("endpoint {0} does not exist")]
    NotFound(String),

    #[error("invalid alias target: {0}")]
    InvalidTarget(String),

    /// Delete blocked; carries the endpoint and the names depending on it.
    #[error("endpoint {name} is referenced by {}", dependents.join(", "))]
    DependencyConflict { name: String, dependents: Vec<String> },

    #[error("version {supplied} for {name} is stale, current version is {current}")]
    VersionConflict { name: String, supplied: u64, current: u64 },

    #[error("unknown URI: {0}")]
    UnknownUri(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("another endpoint mutation is in progress, retry later")]
    MutationInProgress,

    #[error("evaluation timed out after {0:.1}s")]
    Timeout(f64),

    #[error("state file unavailable: {0}")]
    ConfigMissing(String),

    #[error("failed to write state file: {0}")]
    WriteError(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidName(_)
            | ServiceError::InvalidTarget(_)
            | ServiceError::BadRequest(_)
            | ServiceError::QueryFailed(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) | ServiceError::UnknownUri(_) => StatusCode::NOT_FOUND,
            ServiceError::DuplicateName(_)
            | ServiceError::DependencyConflict { .. }
            | ServiceError::VersionConflict { .. } => StatusCode::CONFLICT,
            ServiceError::MutationInProgress => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ServiceError::ConfigMissing(_) | ServiceError::WriteError(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short, stable label used as the `message` field of error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::InvalidName(_) => "InvalidName",
            ServiceError::DuplicateName(_) => "DuplicateName",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::InvalidTarget(_) => "InvalidTarget",
            ServiceError::DependencyConflict { .. } => "DependencyConflict",
            ServiceError::VersionConflict { .. } => "VersionConflict",
            ServiceError::UnknownUri(_) => "UnknownURI",
            ServiceError::QueryFailed(_) => "QueryFailed",
            ServiceError::MutationInProgress => "MutationInProgress",
            ServiceError::Timeout(_) => "TimeoutError",
            ServiceError::ConfigMissing(_) => "ConfigMissing",
            ServiceError::WriteError(_) => "WriteError",
            ServiceError::BadRequest(_) => "BadRequest",
            ServiceError::Internal(_) => "Internal",
        }
    }

    fn info(&self) -> JsonValue {
        match self {
            ServiceError::DependencyConflict { name, dependents } => serde_json::json!({
                "detail": self.to_string(),
                "endpoint": name,
                "dependents": dependents,
            }),
            _ => JsonValue::String(self.to_string()),
        }
    }
}

#[inline]
pub fn json_error(status: StatusCode, message: impl Into<String>, info: JsonValue) -> Response {
    let body = serde_json::json!({ "message": message.into(), "info": info });
    (status, Json(body)).into_response()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        json_error(status, self.kind(), self.info())
    }
}
