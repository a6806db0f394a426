//! API error taxonomy and its HTTP rendering.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use pushline_core::Plan;
use pushline_storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or missing input (empty message, bad topic name, unknown
    /// channel type).
    #[error("{0}")]
    Validation(String),

    /// Missing or wrong credential for a private topic, or a missing owner
    /// identity on the management API.
    #[error("{0}")]
    Unauthorized(String),

    /// Plan entitlement denied (topic count, private topics, webhooks).
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Duplicate topic name.
    #[error("{0}")]
    Conflict(String),

    /// Monthly push ceiling reached.
    #[error("Monthly push limit reached for the {plan} plan ({used}/{limit}). Upgrade for a higher limit.")]
    QuotaExceeded { plan: Plan, used: i64, limit: i64 },

    /// Too many requests inside the current window.
    #[error("Too many requests. Retry in {retry_after}s.")]
    RateLimited { retry_after: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::QuotaExceeded { .. } | Self::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::NotFound { .. } => Self::NotFound(err.to_string()),
            StorageError::AlreadyExists { .. } => Self::Conflict(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = match &self {
            Self::QuotaExceeded { plan, used, limit } => json!({
                "error": self.to_string(),
                "plan": plan,
                "used": used,
                "limit": limit,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after } = self {
            if let Ok(value) = retry_after.to_string().parse() {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
