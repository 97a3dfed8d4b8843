use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::engine::EngineError;
use crate::jobs::JobError;

/// Errors surfaced by API handlers and the manager facade.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// A resource is busy with something that blocks the request.
    #[error("{0}")]
    Busy(String),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Busy(_) => StatusCode::CONFLICT,
            AppError::Job(JobError::Conflict(_)) | AppError::Job(JobError::NotCancellable(_)) => {
                StatusCode::CONFLICT
            }
            AppError::Job(JobError::NoActiveJob(_)) => StatusCode::NOT_FOUND,
            AppError::Job(JobError::Terminate { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Engine(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "ok": false, "detail": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
