use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::models::ErrorResponse;
use crate::admission::AdmissionError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("script kind not allowed: {0}")]
    UnsupportedScriptKind(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("node overloaded: {0}")]
    Overloaded(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedScriptKind(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::UnsupportedScriptKind(_) => "UNSUPPORTED_SCRIPT_KIND",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Overloaded(_) => "OVERLOADED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<AdmissionError> for ApiError {
    fn from(value: AdmissionError) -> Self {
        match value {
            AdmissionError::UnknownScriptKind(_)
            | AdmissionError::EmptyScript
            | AdmissionError::UnknownCatalog(_)
            | AdmissionError::UnknownTargetNode(_)
            | AdmissionError::UnknownUploadedFile(_) => {
                ApiError::InvalidPayload(value.to_string())
            }
            AdmissionError::KindNotAllowed(kind) => {
                ApiError::UnsupportedScriptKind(kind.to_string())
            }
            AdmissionError::ScriptTooLarge { size, .. } => ApiError::PayloadTooLarge(size),
            AdmissionError::Overloaded(err) => ApiError::Overloaded(err.to_string()),
            AdmissionError::Catalog(err) => ApiError::Internal(err.to_string()),
            AdmissionError::Store(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::JobNotFound(id) => ApiError::NotFound(format!("job {id}")),
            StoreError::RequestNotFound(id) => ApiError::NotFound(format!("request {id}")),
            StoreError::Conflict { .. } | StoreError::RequestNotPending { .. } => {
                ApiError::Conflict(value.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
