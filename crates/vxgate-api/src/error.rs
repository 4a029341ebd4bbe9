// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! API error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use vxgate_config::ConfigError;

/// Faults surfaced by management handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Configuration parsing, validation, or persistence failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            // I/O failures are server-side; everything else in the config
            // pipeline is the caller's document.
            ApiError::Config(ConfigError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Config(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Convenience alias for handler results.
pub type ApiResult<T> = Result<T, ApiError>;
