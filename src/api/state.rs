//! Shared handler state and the JSON error envelope.

use crate::error::{Error, ErrorClass, PipelineError, ValidationError};
use crate::hub::Hub;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// State handed to every handler.
#[derive(Debug, Clone)]
pub struct ApiState {
    pub hub: Hub,
}

impl ApiState {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    /// Requests may name a user; a single-tenant deployment falls back to the
    /// configured owner.
    pub(super) fn user_or_default(&self, user_id: Option<String>) -> String {
        user_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| self.hub.default_user().to_string())
    }
}

/// A crate error rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Pipeline(PipelineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Validation(ValidationError::InvalidSignature) => StatusCode::FORBIDDEN,
            error => match error.class() {
                ErrorClass::Auth => StatusCode::UNAUTHORIZED,
                ErrorClass::Validation => StatusCode::BAD_REQUEST,
                ErrorClass::Transient => StatusCode::BAD_GATEWAY,
                ErrorClass::Permanent => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, %status, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}
