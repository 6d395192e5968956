//! # API Error Mapping
//!
//! Maps intake sentinel errors and store failures to the HTTP statuses of
//! the control API contract.

use crate::orchestration::intake::IntakeError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "API internal error");
        }
        let body = Json(ErrorBody {
            error: self.code,
            message: &self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(error: IntakeError) -> Self {
        match &error {
            IntakeError::DefinitionNotFound { .. } => {
                ApiError::not_found("definition_not_found", error.to_string())
            }
            IntakeError::RunNotFound(_) => ApiError::not_found("run_not_found", error.to_string()),
            IntakeError::StepNotFound { .. } => {
                ApiError::not_found("step_not_found", error.to_string())
            }
            IntakeError::RunTerminal { .. } => ApiError::conflict("run_terminal", error.to_string()),
            IntakeError::InvalidDefinition(_) => ApiError::bad_request(error.to_string()),
            IntakeError::Database(_) => ApiError::internal(error.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        ApiError::internal(error.to_string())
    }
}
