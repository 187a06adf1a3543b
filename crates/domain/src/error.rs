//! Domain error types.

use event_store::{EventStoreError, SequenceId};
use messaging::MessagingError;
use thiserror::Error;

/// Errors that can occur while loading, saving or replaying aggregates.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Events were persisted but at least one subscriber failed.
    #[error("Event publication failed: {0}")]
    Publication(#[from] MessagingError),

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: String,
    },

    /// A stored event of a known type could not be decoded.
    #[error("Cannot decode {event_type} at {sequence_id}: {source}")]
    UndecodableEvent {
        event_type: String,
        sequence_id: SequenceId,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// True when the failure came from a stale expected version.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            DomainError::EventStore(EventStoreError::ConcurrencyConflict { .. })
        )
    }
}
