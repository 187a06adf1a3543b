use thiserror::Error;

use crate::JobId;

/// Errors raised by the bus, the queue and the workers.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// One or more subscribers failed while handling a published event.
    #[error("Handler errors for {event_type}: {}", failures.join(", "))]
    HandlerFailed {
        event_type: String,
        failures: Vec<String>,
    },

    /// A handler could not react to an event.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
