use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use tally_ocr::{CacheError, ExtractionError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Extraction(e) => match e.kind() {
                "input_error" => StatusCode::BAD_REQUEST,
                "extraction_failed" => StatusCode::UNPROCESSABLE_ENTITY,
                "cancelled" => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest(message) => json!({
                "error": "bad_request",
                "message": message,
                "recommendations": [],
            }),
            ApiError::Extraction(e) => {
                if status.is_server_error() {
                    tracing::error!(kind = e.kind(), "Extraction error: {e}");
                }
                json!({
                    "error": e.kind(),
                    "message": e.user_message(),
                    "recommendations": e.recommendations(),
                    "stages": e.stages(),
                })
            }
            ApiError::Cache(e) => {
                tracing::error!("Cache maintenance failed: {e}");
                json!({
                    "error": "internal",
                    "message": "cache maintenance failed",
                    "recommendations": [],
                })
            }
        };
        (status, Json(body)).into_response()
    }
}
