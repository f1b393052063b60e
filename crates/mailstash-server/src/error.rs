//! HTTP error mapping
//!
//! Signature and request problems surface as 4xx; engine failures as
//! 5xx so the provider redelivers; a busy engine as 409.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mailstash::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Engine(EngineError::SyncInProgress) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            ServerError::Engine(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
