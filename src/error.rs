use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::api::response;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Malformed date: {0}")]
    MalformedDate(String),

    #[error("Invalid request: {0}")]
    InvalidQuery(String),

    #[error("News provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Could not parse scores from model output: {reason}")]
    ScoringParse { reason: String, raw: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedDate(_) | AppError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            AppError::ScoringParse { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ModelTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ModelUnavailable(_) | AppError::ProviderUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Extra payload carried by error responses that have diagnostics to share.
#[derive(Serialize)]
pub struct ErrorDetail {
    pub raw: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        match self {
            AppError::ScoringParse { raw, .. } => {
                response::error_with(status, message, ErrorDetail { raw }).into_response()
            }
            _ => response::error::<()>(status, message).into_response(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
