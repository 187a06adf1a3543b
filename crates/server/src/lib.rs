//! Workflow server for the telemedicine sagas.
//!
//! Runs the step workers and exposes health, Prometheus metrics and a saga
//! audit endpoint, with structured logging (tracing) throughout.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use event_store::EventStore;
use messaging::{InMemoryEventBus, InMemoryJobQueue};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    Collaborators, InMemoryInventoryService, InMemoryPrescriptionService, InMemoryShipmentService,
    SagaRuntime,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
pub use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas/{id}/events", get(routes::sagas::events))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Collaborators backed by the in-memory prescription, inventory and
/// shipment services.
pub fn in_memory_collaborators() -> Collaborators {
    Collaborators {
        prescriptions: Arc::new(InMemoryPrescriptionService::new()),
        inventory: Arc::new(InMemoryInventoryService::new()),
        shipments: Arc::new(InMemoryShipmentService::new()),
    }
}

/// Installs the saga runtime over `store` with an in-process bus and job queue.
pub async fn build_runtime(
    store: Arc<dyn EventStore>,
    config: &Config,
) -> SagaRuntime<Arc<dyn EventStore>> {
    SagaRuntime::install(
        store,
        Arc::new(InMemoryEventBus::new()),
        Arc::new(InMemoryJobQueue::new()),
        in_memory_collaborators(),
        config.retry_policy(),
    )
    .await
}
