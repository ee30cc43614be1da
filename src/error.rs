//! Application error types and result alias.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::dispatcher::DispatchError;
use crate::utils::now_millis;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Rejected input. Raised before any row is written.
    #[error("{0}")]
    Validation(String),

    /// Also used for ownership failures so that existence is not leaked.
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    /// A gating dispatch failed; the staged rows were compensated.
    #[error("Node sync failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Port allocation failed: {0}")]
    Allocation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    fn status_and_code(&self) -> (StatusCode, i64) {
        match self {
            AppError::Validation(_) | AppError::Allocation(_) => (StatusCode::BAD_REQUEST, -1),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, -1),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, 401),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, 403),
            AppError::Dispatch(_) => (StatusCode::BAD_GATEWAY, -1),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, -1),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let msg = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "Database error".to_string()
            }
            AppError::Migration(_) | AppError::Internal(_) | AppError::Config(_) => {
                tracing::error!("{}", self);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "code": code,
            "msg": msg,
            "ts": now_millis(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_keeps_message() {
        let err = AppError::Forbidden("IP not allowed".to_string());
        assert_eq!(err.to_string(), "IP not allowed");
        assert_eq!(err.status_and_code(), (StatusCode::FORBIDDEN, 403));
    }

    #[test]
    fn test_dispatch_maps_to_bad_gateway() {
        let err = AppError::from(DispatchError::NodeNotFound(7));
        assert_eq!(err.status_and_code().0, StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("node 7"));
    }
}
