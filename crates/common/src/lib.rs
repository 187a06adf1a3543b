//! Identifiers and value types shared across the workspace.

mod types;

pub use types::{AggregateId, CorrelationId, Money, PatientId, SubscriptionId};
