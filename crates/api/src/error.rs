use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use syllabus_domain::error::DomainError;
use syllabus_domain::ports::jobs::JobQueueError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    PolicyViolation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::PolicyViolation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::PolicyViolation(_) => "policy_violation",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Internal => "internal_error",
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        if err.is_transient() {
            tracing::warn!(error = %err, "transient failure surfaced to client");
            return ApiError::ServiceUnavailable(err.to_string());
        }
        match err {
            DomainError::Validation(message) => ApiError::Validation(message),
            DomainError::UnknownEntityType(kind) => {
                ApiError::Validation(format!("unknown entity type: {kind}"))
            }
            DomainError::Policy(violation) => ApiError::PolicyViolation(violation.message),
            DomainError::NotFound(what) => ApiError::NotFound(what),
            DomainError::Queue(JobQueueError::NotFound(what)) => ApiError::NotFound(what),
            DomainError::Conflict(message) => ApiError::Conflict(message),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
