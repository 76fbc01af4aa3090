//! Core error taxonomy, mapped to HTTP status codes at the API boundary.

use axum::{http::StatusCode, response::IntoResponse, response::Json, response::Response};
use serde::Serialize;

/// Errors raised by the Build Store, Backend Pool, and Scheduler.
///
/// Per-package build failures are *not* represented here — they surface as
/// `PackageBuild::status == Failed` with an `errorMessage`, never as an HTTP
/// error, because the build submission itself succeeded.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("store closed")]
    Closed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::InUse(_) => StatusCode::CONFLICT,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if matches!(self, ServiceError::Internal(_)) {
            tracing::error!(error = %self, "internal invariant violation");
        }
        let kind = match &self {
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::InUse(_) => "InUse",
            ServiceError::BadRequest(_) => "BadRequest",
            ServiceError::Closed => "Closed",
            ServiceError::Internal(_) => "Internal",
        };
        let status = self.status();
        let body = ErrorBody {
            error: kind,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
