//! HTTP-facing error envelope (§6), modeled on the teacher's
//! `web::WebError`/`IntoResponse` pattern: one enum, one `IntoResponse`
//! impl, a `{ok, error, detail}` JSON body.

use crate::core::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    ok: bool,
    error: String,
    detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self { status, code, detail: detail.into() }
    }

    pub fn invalid_environment_path(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_environment_path", detail)
    }

    pub fn not_authed(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "not_authed", detail)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = match err.code() {
            "not_authed" => StatusCode::UNAUTHORIZED,
            "template_not_found" | "environment_not_found" | "run_not_found" | "not_found" => StatusCode::NOT_FOUND,
            "precondition_failed" => StatusCode::PRECONDITION_FAILED,
            "conflict" => StatusCode::CONFLICT,
            "invalid_dsl" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, code: err.code(), detail: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope { ok: false, error: self.code.to_string(), detail: self.detail };
        (self.status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
