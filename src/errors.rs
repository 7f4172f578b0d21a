use axum::{http::StatusCode, Json};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the backend.
///
/// `Validation` and `Spawn` are raised before any child process exists.
/// Timeouts and cancellations are not errors: a timed-out or cancelled run
/// still produced partial, redacted output and is reported inside
/// `runner::ExecutionResult`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("origin denied")]
    OriginDenied,
    #[error("request too large")]
    RequestTooLarge,
    #[error("rate limited")]
    RateLimited,
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("path outside allowed roots")]
    PathOutsideRoot,
    #[error("no project open")]
    NoProject,
    #[error("a run is already in progress")]
    RunInProgress,
    #[error("not found")]
    NotFound,
    #[error("failed to start process: {0}")]
    Spawn(String),
    #[error("operation error: {0}")]
    Op(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Validation reasons must never embed the offending value when the
    /// value may be sensitive.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        AppError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "Unauthorized",
            AppError::OriginDenied => "OriginDenied",
            AppError::RequestTooLarge => "RequestTooLarge",
            AppError::RateLimited => "RateLimited",
            AppError::Validation { .. } => "Validation",
            AppError::PathOutsideRoot => "PathOutsideRoot",
            AppError::NoProject => "NoProject",
            AppError::RunInProgress => "RunInProgress",
            AppError::NotFound => "NotFound",
            AppError::Spawn(_) => "Spawn",
            AppError::Op(_) => "Op",
            AppError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::OriginDenied | AppError::PathOutsideRoot => StatusCode::FORBIDDEN,
            AppError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Validation { .. } | AppError::NoProject | AppError::Op(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::RunInProgress => StatusCode::CONFLICT,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Spawn(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

pub fn into_response(err: AppError) -> (StatusCode, Json<ErrorBody>) {
    let code = err.code();
    let message = err.to_string();
    (err.status(), Json(ErrorBody { code, message }))
}
