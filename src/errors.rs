use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::token::TokenStatus;

/// Error classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input; no store was touched.
    Validation,
    /// Valid input that the current desk state rejects; retry with other input.
    Domain,
    /// The fast queue and the ledger disagree.
    Consistency,
    /// A store is unreachable or failed.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Domain => "domain_error",
            ErrorKind::Consistency => "consistency_error",
            ErrorKind::Infrastructure => "infrastructure_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("service '{0}' is not active")]
    ServiceInactive(String),

    #[error("counter {0} not found")]
    CounterNotFound(i32),

    #[error("counter {0} is closed")]
    CounterClosed(i32),

    #[error("counter {counter_id} does not support service '{service_id}'")]
    CapabilityMismatch { counter_id: i32, service_id: String },

    #[error("no open counter available for service '{0}'")]
    NoAvailableCounter(String),

    #[error("token {0} not found")]
    TokenNotFound(String),

    #[error("token {token_id} is {from}; cannot move to {to}")]
    InvalidTransition {
        token_id: String,
        from: TokenStatus,
        to: TokenStatus,
    },

    #[error("data inconsistency for token {token_id}: {detail}")]
    DataInconsistency { token_id: String, detail: String },

    #[error("queue unavailable: {0:#}")]
    QueueUnavailable(anyhow::Error),

    #[error("ledger error: {0:#}")]
    Ledger(anyhow::Error),

    #[error("catalog error: {0:#}")]
    Catalog(anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::ServiceNotFound(_)
            | AppError::ServiceInactive(_)
            | AppError::CounterNotFound(_)
            | AppError::CounterClosed(_)
            | AppError::CapabilityMismatch { .. }
            | AppError::NoAvailableCounter(_)
            | AppError::TokenNotFound(_)
            | AppError::InvalidTransition { .. } => ErrorKind::Domain,
            AppError::DataInconsistency { .. } => ErrorKind::Consistency,
            AppError::QueueUnavailable(_) | AppError::Ledger(_) | AppError::Catalog(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "invalid_request",
            AppError::ServiceNotFound(_) => "service_not_found",
            AppError::ServiceInactive(_) => "service_inactive",
            AppError::CounterNotFound(_) => "counter_not_found",
            AppError::CounterClosed(_) => "counter_closed",
            AppError::CapabilityMismatch { .. } => "capability_mismatch",
            AppError::NoAvailableCounter(_) => "no_available_counter",
            AppError::TokenNotFound(_) => "token_not_found",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::DataInconsistency { .. } => "data_inconsistency",
            AppError::QueueUnavailable(_) => "queue_unavailable",
            AppError::Ledger(_) | AppError::Catalog(_) => "internal_server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceNotFound(_)
            | AppError::CounterNotFound(_)
            | AppError::TokenNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceInactive(_)
            | AppError::CounterClosed(_)
            | AppError::NoAvailableCounter(_)
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::CapabilityMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DataInconsistency { .. } | AppError::Ledger(_) | AppError::Catalog(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let msg = match &self {
            AppError::Ledger(e) => {
                tracing::error!("Ledger error: {:#}", e);
                "internal server error".to_string()
            }
            AppError::Catalog(e) => {
                tracing::error!("Catalog error: {:#}", e);
                "internal server error".to_string()
            }
            AppError::QueueUnavailable(e) => {
                tracing::warn!("Queue unavailable: {:#}", e);
                "queue store is unavailable, try again shortly".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": self.kind().as_str(),
                "code": self.code(),
            }
        }));

        let mut response = (self.status(), body).into_response();

        if matches!(self, AppError::QueueUnavailable(_)) {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("5"),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_client_statuses() {
        assert_eq!(AppError::CounterClosed(2).status(), StatusCode::CONFLICT);
        assert_eq!(AppError::CounterNotFound(9).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::CapabilityMismatch { counter_id: 1, service_id: "WDL".into() }.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(AppError::CounterClosed(2).kind(), ErrorKind::Domain);
    }

    #[test]
    fn test_consistency_error_is_server_side() {
        let err = AppError::DataInconsistency {
            token_id: "20251220-001".into(),
            detail: "queued but missing from ledger".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("20251220-001"));
    }

    #[test]
    fn test_queue_unavailable_sets_retry_after() {
        let resp = AppError::QueueUnavailable(anyhow::anyhow!("connection refused")).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
    }
}
