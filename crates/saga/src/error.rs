//! Saga error types.

use common::AggregateId;
use domain::DomainError;
use messaging::MessagingError;
use thiserror::Error;

use crate::services::ServiceError;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The requested state is not reachable from the current one.
    #[error("Invalid {saga_type} transition from {from} to {to} (trigger: {trigger})")]
    InvalidTransition {
        saga_type: &'static str,
        from: &'static str,
        to: &'static str,
        trigger: String,
    },

    /// The saga has no `Started` event yet.
    #[error("{saga_type} has not been started")]
    NotStarted { saga_type: &'static str },

    /// Saga has already been started.
    #[error("{saga_type} has already been started")]
    AlreadyStarted { saga_type: &'static str },

    /// The operation is not available in the saga's current state.
    #[error("{operation} is not allowed while {saga_type} is {state}")]
    UnexpectedState {
        saga_type: &'static str,
        state: &'static str,
        operation: &'static str,
    },

    /// A command carried invalid business data.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dunning already used every scheduled attempt.
    #[error("Retry limit exceeded: attempt {attempt} of {max_attempts}")]
    RetryLimitExceeded { attempt: u32, max_attempts: u32 },

    /// Escalation levels must strictly increase.
    #[error("Escalation level must increase: current {current}, requested {requested}")]
    EscalationLevelNotIncreasing { current: u8, requested: u8 },

    /// The saga's events were stored but could not be delivered on the bus.
    /// Retrying the command would duplicate work; use
    /// [`crate::WorkflowService::redeliver`] instead.
    #[error("Saga {saga_id} was updated but its events were not delivered: {source}")]
    Undelivered {
        saga_id: AggregateId,
        source: MessagingError,
    },

    /// A collaborator call failed.
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// True for errors that come from a stale aggregate version and may
    /// succeed when retried.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, SagaError::Domain(e) if e.is_concurrency_conflict())
    }

    /// Turns a publication failure after a successful append into
    /// [`SagaError::Undelivered`] for `saga_id`.
    pub(crate) fn undelivered(self, saga_id: AggregateId) -> Self {
        match self {
            SagaError::Domain(DomainError::Publication(source)) => {
                SagaError::Undelivered { saga_id, source }
            }
            other => other,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
