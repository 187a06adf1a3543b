use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use event_store::StoredEvent;
use tokio::sync::RwLock;

use crate::{MessagingError, Result};

/// Reacts to persisted events delivered by an [`EventBus`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &StoredEvent) -> Result<()>;
}

/// Publish/subscribe channel for persisted events.
///
/// Only events that are already in the store are published, so a handler can
/// always find the event it reacts to by replaying the aggregate.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Delivers an event to every handler subscribed to its type.
    async fn publish(&self, event: &StoredEvent) -> Result<()>;

    /// Publishes events in order, stopping at the first failure.
    async fn publish_all(&self, events: &[StoredEvent]) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>);

    async fn subscribe_all(&self, event_types: &[&str], handler: Arc<dyn EventHandler>) {
        for event_type in event_types {
            self.subscribe(event_type, Arc::clone(&handler)).await;
        }
    }
}

/// In-process event bus.
///
/// Delivery is synchronous: `publish` returns once every subscriber has run.
/// Every published event is also captured for inspection.
#[derive(Default)]
pub struct InMemoryEventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    published: RwLock<Vec<StoredEvent>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event published so far.
    pub async fn published_events(&self) -> Vec<StoredEvent> {
        self.published.read().await.clone()
    }

    /// Returns the published events of one type.
    pub async fn events_of_type(&self, event_type: &str) -> Vec<StoredEvent> {
        self.published
            .read()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub async fn has_event(&self, event_type: &str) -> bool {
        self.published
            .read()
            .await
            .iter()
            .any(|e| e.event_type() == event_type)
    }

    pub async fn event_count(&self) -> usize {
        self.published.read().await.len()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &StoredEvent) -> Result<()> {
        self.published.write().await.push(event.clone());

        // Handlers may publish in turn, so the lock is released before any of them runs.
        let type_handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .get(event.event_type())
            .cloned()
            .unwrap_or_default();

        let mut failures = Vec::new();
        for handler in type_handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!(
                    handler = handler.name(),
                    event_type = event.event_type(),
                    sequence_id = %event.sequence_id,
                    error = %e,
                    "event handler failed"
                );
                failures.push(format!("{}: {}", handler.name(), e));
            }
        }

        if !failures.is_empty() {
            return Err(MessagingError::HandlerFailed {
                event_type: event.event_type().to_string(),
                failures,
            });
        }

        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        tracing::debug!(event_type, handler = handler.name(), "subscribing handler");
        self.handlers
            .write()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }
}
