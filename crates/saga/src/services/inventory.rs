//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use tokio::sync::Mutex;

use super::{FaultPlan, ServiceError};

const SERVICE: &str = "inventory service";

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for an order and returns the reservation id.
    async fn reserve(
        &self,
        order_id: AggregateId,
        medication: &str,
        quantity: u32,
    ) -> Result<String, ServiceError>;

    /// Releases a previously made reservation.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (AggregateId, String, u32)>,
    next_id: u32,
    reserve_calls: u32,
    release_calls: u32,
    reserve_faults: FaultPlan,
    release_faults: FaultPlan,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<Mutex<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_reserve_times(&self, times: u32) {
        self.state.lock().await.reserve_faults.fail_times(times);
    }

    pub async fn fail_reserve_always(&self) {
        self.state.lock().await.reserve_faults.fail_always();
    }

    pub async fn fail_release_always(&self) {
        self.state.lock().await.release_faults.fail_always();
    }

    pub async fn reserve_calls(&self) -> u32 {
        self.state.lock().await.reserve_calls
    }

    pub async fn release_calls(&self) -> u32 {
        self.state.lock().await.release_calls
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.lock().await.reservations.len()
    }

    pub async fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state
            .lock()
            .await
            .reservations
            .contains_key(reservation_id)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        order_id: AggregateId,
        medication: &str,
        quantity: u32,
    ) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;
        state.reserve_calls += 1;
        state.reserve_faults.check(SERVICE, "reserve")?;

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id, medication.to_string(), quantity));
        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        state.release_calls += 1;
        state.release_faults.check(SERVICE, "release")?;

        state.reservations.remove(reservation_id);
        Ok(())
    }
}
