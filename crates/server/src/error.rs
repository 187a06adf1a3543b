//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Saga(#[from] SagaError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Domain(err) => domain_status(err),
            ApiError::Saga(err) => saga_status(err),
        }
    }
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::AggregateNotFound { .. } => StatusCode::NOT_FOUND,
        e if e.is_concurrency_conflict() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::NotStarted { .. } => StatusCode::NOT_FOUND,
        SagaError::InvalidTransition { .. }
        | SagaError::AlreadyStarted { .. }
        | SagaError::UnexpectedState { .. } => StatusCode::CONFLICT,
        SagaError::InvalidInput(_)
        | SagaError::RetryLimitExceeded { .. }
        | SagaError::EscalationLevelNotIncreasing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        SagaError::Domain(e) => domain_status(e),
        SagaError::Service(_) => StatusCode::BAD_GATEWAY,
        SagaError::Undelivered { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SagaError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_is_a_conflict() {
        let err = ApiError::from(SagaError::InvalidTransition {
            saga_type: "SubscriptionRenewalSaga",
            from: "pending_payment_method_check",
            to: "completed",
            trigger: "complete".into(),
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn missing_saga_is_not_found() {
        let err = ApiError::from(DomainError::AggregateNotFound {
            aggregate_type: "DunningManagementSaga",
            aggregate_id: "x".into(),
        });
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::BadRequest("bad id".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
