//! Saga audit endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::AggregateId;
use event_store::{EventStore, StoredEvent};
use saga::WorkflowService;
use serde::Serialize;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub workflows: WorkflowService<Arc<dyn EventStore>>,
    pub store_kind: &'static str,
}

#[derive(Serialize)]
pub struct SagaHistoryResponse {
    pub saga_id: String,
    pub saga_type: String,
    pub version: i64,
    pub events: Vec<StoredEvent>,
}

/// GET /sagas/{id}/events: the full stored history of one saga.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaHistoryResponse>, ApiError> {
    let saga_id: AggregateId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid saga id: {id}")))?;

    let events = state.workflows.history(saga_id).await?;
    let Some((saga_type, version)) = events
        .last()
        .map(|e| (e.aggregate_type().to_string(), e.version().as_i64()))
    else {
        return Err(ApiError::NotFound(format!("saga {saga_id} not found")));
    };

    Ok(Json(SagaHistoryResponse {
        saga_id: saga_id.to_string(),
        saga_type,
        version,
        events,
    }))
}
