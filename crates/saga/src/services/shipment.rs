//! Shipment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use tokio::sync::Mutex;

use super::{FaultPlan, ServiceError};

const SERVICE: &str = "shipment service";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentRequest {
    pub order_id: AggregateId,
    pub reservation_id: String,
    pub shipping_address: String,
}

/// Hands reserved stock to a carrier.
#[async_trait]
pub trait ShipmentService: Send + Sync {
    /// Starts a shipment and returns its identifier.
    async fn initiate_shipment(&self, request: &ShipmentRequest) -> Result<String, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryShipmentState {
    shipments: HashMap<String, ShipmentRequest>,
    next_id: u32,
    calls: u32,
    faults: FaultPlan,
}

/// In-memory shipment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShipmentService {
    state: Arc<Mutex<InMemoryShipmentState>>,
}

impl InMemoryShipmentService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_times(&self, times: u32) {
        self.state.lock().await.faults.fail_times(times);
    }

    pub async fn fail_always(&self) {
        self.state.lock().await.faults.fail_always();
    }

    pub async fn calls(&self) -> u32 {
        self.state.lock().await.calls
    }

    pub async fn shipment_count(&self) -> usize {
        self.state.lock().await.shipments.len()
    }
}

#[async_trait]
impl ShipmentService for InMemoryShipmentService {
    async fn initiate_shipment(&self, request: &ShipmentRequest) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        state.faults.check(SERVICE, "initiate shipment")?;

        state.next_id += 1;
        let shipment_id = format!("SHP-{:04}", state.next_id);
        state.shipments.insert(shipment_id.clone(), request.clone());
        Ok(shipment_id)
    }
}
