use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{AggregateId, EventStoreError};

/// Metadata key naming the component that produced an event.
pub const METADATA_SOURCE: &str = "source";

/// Metadata key carrying the correlation id of the originating request.
pub const METADATA_CORRELATION_ID: &str = "correlation_id";

/// Metadata key carrying the id of the event or job that caused this event.
pub const METADATA_CAUSATION_ID: &str = "causation_id";

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-aggregate version, used for compare-and-append.
///
/// Versions start at 1 for the first event and increment by 1 for each
/// subsequent event on an aggregate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version (0) of an aggregate with no events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the version (1) of the first event.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global, monotonically increasing position of a stored event in the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(i64);

impl SequenceId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A domain event ready to be persisted.
///
/// `(aggregate_type, event_type)` is the taxonomy key used for storage and
/// routing; `aggregate_id` selects the logical stream the event belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "PrescriptionCreated").
    pub event_type: String,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "OrderFulfillmentSaga").
    pub aggregate_type: String,

    /// The version of the aggregate after this event.
    pub version: Version,

    /// When the fact happened.
    pub occurred_at: DateTime<Utc>,

    /// Business data.
    pub payload: serde_json::Value,

    /// Cross-cutting context (source, correlation id, causation id).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the correlation id recorded in the metadata, if any.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.metadata
            .get(METADATA_CORRELATION_ID)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Returns the producing component recorded in the metadata, if any.
    pub fn source(&self) -> Option<&str> {
        self.metadata.get(METADATA_SOURCE).and_then(|v| v.as_str())
    }

    /// Deserializes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    occurred_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets when the event occurred. If not set, the current time is used.
    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Merges a whole metadata map; later keys win.
    pub fn metadata_map(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn correlation_id(self, id: CorrelationId) -> Self {
        self.metadata(
            METADATA_CORRELATION_ID,
            serde_json::Value::String(id.to_string()),
        )
    }

    pub fn source(self, source: impl Into<String>) -> Self {
        self.metadata(METADATA_SOURCE, serde_json::Value::String(source.into()))
    }

    /// Builds the envelope, failing if a required field was not set.
    pub fn build(self) -> Result<EventEnvelope, EventStoreError> {
        let missing = |field: &str| EventStoreError::InvalidEvent(format!("{field} is required"));

        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type.ok_or_else(|| missing("event_type"))?,
            aggregate_id: self.aggregate_id.ok_or_else(|| missing("aggregate_id"))?,
            aggregate_type: self.aggregate_type.ok_or_else(|| missing("aggregate_type"))?,
            version: self.version.ok_or_else(|| missing("version"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            payload: self.payload.ok_or_else(|| missing("payload"))?,
            metadata: self.metadata,
        })
    }
}

/// The durable record of an [`EventEnvelope`].
///
/// Stored events are never updated or deleted; `sequence_id` is assigned by
/// the store at append time and orders the whole log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub sequence_id: SequenceId,

    #[serde(flatten)]
    pub event: EventEnvelope,
}

impl StoredEvent {
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.event.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.event.aggregate_type
    }

    pub fn version(&self) -> Version {
        self.event.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.event.occurred_at
    }
}
