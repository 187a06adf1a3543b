//! Append-only event log for the workflow core.
//!
//! Events are appended per aggregate with compare-and-append on the
//! aggregate version, and every stored event receives a global sequence id.
//! Two backends share the [`EventStore`] trait: [`InMemoryEventStore`] and
//! [`PostgresEventStore`].

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{
    EventEnvelope, EventEnvelopeBuilder, EventId, METADATA_CAUSATION_ID, METADATA_CORRELATION_ID,
    METADATA_SOURCE, SequenceId, StoredEvent, Version,
};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::EventQuery;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream};
