//! Error taxonomy shared across the ingest, worker and query processes.
//!
//! Each subsystem owns a leaf `thiserror` enum; [`ApiError`] is the HTTP
//! boundary type every axum handler returns, mapping each leaf kind to the
//! right status code and error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Coarse error kind used in structured log lines (`error_kind` field) and in
/// API error bodies, independent of which subsystem raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimit,
    CircuitOpen,
    BusTransient,
    StoreTransient,
    StoreFatal,
    Deserialization,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus produce timed out")]
    Timeout,
    #[error("bus transient failure: {0}")]
    Transient(String),
    #[error("payload too large: {size} bytes > {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("producer is shutting down")]
    Closed,
}

impl BusError {
    /// Transient failures are the ones the circuit breaker and producer
    /// retry loop care about; the rest surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Timeout | BusError::Transient(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit open, retry after {retry_after_secs}s")]
    Open { retry_after_secs: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store transient failure: {0}")]
    Transient(#[from] rusqlite::Error),
    #[error("store pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("store fatal failure: {0}")]
    Fatal(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: {message}")]
    Field { field: String, message: String },
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VqlError {
    #[error("validation failed at {rule}: {message}")]
    Validation { rule: String, message: String },
    #[error("execution error: {0}")]
    Execution(#[from] StoreError),
}

/// The single error type axum handlers return.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error(transparent)]
    CircuitOpen(#[from] CircuitError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vql(#[from] VqlError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::Unauthorized => ErrorKind::Auth,
            ApiError::RateLimited { .. } => ErrorKind::RateLimit,
            ApiError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            ApiError::Store(_) => ErrorKind::StoreTransient,
            ApiError::Vql(VqlError::Validation { .. }) => ErrorKind::Validation,
            ApiError::Vql(VqlError::Execution(_)) => ErrorKind::Internal,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Vql(VqlError::Validation { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Vql(VqlError::Execution(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            ApiError::CircuitOpen(CircuitError::Open { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after();
        let field = match &self {
            ApiError::Validation(ValidationError::Field { field, .. }) => Some(field.clone()),
            ApiError::Vql(VqlError::Validation { rule, .. }) => Some(rule.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            error_kind: self.kind(),
            field,
        };
        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
