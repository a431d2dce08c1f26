use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::appointment::EditorError;
use crate::booking::{StoreError, SubmitError};
use crate::models::ApiResponse;
use crate::schedule::ScheduleError;
use crate::session::SessionError;

/// Error surfaced at the HTTP boundary, rendered as an `ApiResponse` envelope.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{message}")]
    Upstream {
        message: String,
        details: Option<String>,
    },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, ApiResponse::<()>::error(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ApiResponse::error(msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ApiResponse::error(msg)),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, ApiResponse::error("Unauthorized")),
            AppError::Upstream { message, details } => {
                let body = ApiResponse::error(message);
                let body = match details {
                    Some(details) => body.with_details(details),
                    None => body,
                };
                (StatusCode::BAD_GATEWAY, body)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::error("Internal server error"))
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, ApiResponse::error("Internal server error"))
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<ScheduleError> for AppError {
    fn from(e: ScheduleError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::SubmissionInFlight => AppError::Conflict(e.to_string()),
            other => AppError::Validation(other.to_string()),
        }
    }
}

impl From<EditorError> for AppError {
    fn from(e: EditorError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotTaken { .. } | StoreError::PaymentSettled(_) => {
                AppError::Conflict(e.to_string())
            }
            StoreError::NotFound(what) => AppError::NotFound(format!("{what} not found")),
            StoreError::Database(e) => AppError::Database(e),
            StoreError::Payload(e) => AppError::Internal(e.into()),
        }
    }
}

impl From<SubmitError> for AppError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Session(e) => e.into(),
            SubmitError::ServiceUnavailable(_) => AppError::NotFound(e.to_string()),
            SubmitError::Store(e) => e.into(),
            SubmitError::Checkout { booking_id, source } => {
                tracing::error!("Checkout failed for booking {}: {:#}", booking_id, source);
                AppError::Upstream {
                    message: "Payment checkout could not be started. Please try again.".into(),
                    details: Some(format!("booking_id={booking_id}")),
                }
            }
        }
    }
}
