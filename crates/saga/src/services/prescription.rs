//! Prescription service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, PatientId};
use tokio::sync::Mutex;

use super::{FaultPlan, ServiceError};

const SERVICE: &str = "prescription service";

/// What the pharmacy needs to issue a prescription for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrescriptionRequest {
    pub order_id: AggregateId,
    pub patient_id: PatientId,
    pub medication: String,
    pub quantity: u32,
}

/// Issues and voids prescriptions.
#[async_trait]
pub trait PrescriptionService: Send + Sync {
    /// Creates a prescription and returns its identifier.
    async fn create_prescription(&self, request: &PrescriptionRequest) -> Result<String, ServiceError>;

    async fn cancel_prescription(&self, prescription_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPrescriptionState {
    active: HashMap<String, PrescriptionRequest>,
    cancelled: Vec<String>,
    next_id: u32,
    create_calls: u32,
    create_faults: FaultPlan,
    cancel_faults: FaultPlan,
}

/// In-memory prescription service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPrescriptionService {
    state: Arc<Mutex<InMemoryPrescriptionState>>,
}

impl InMemoryPrescriptionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` create calls fail with a retryable error.
    pub async fn fail_create_times(&self, times: u32) {
        self.state.lock().await.create_faults.fail_times(times);
    }

    pub async fn fail_create_always(&self) {
        self.state.lock().await.create_faults.fail_always();
    }

    /// Every create call is refused with a non-retryable error.
    pub async fn reject_create(&self) {
        self.state.lock().await.create_faults.reject();
    }

    pub async fn fail_cancel_always(&self) {
        self.state.lock().await.cancel_faults.fail_always();
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_cancelled(&self, prescription_id: &str) -> bool {
        self.state
            .lock()
            .await
            .cancelled
            .iter()
            .any(|id| id == prescription_id)
    }
}

#[async_trait]
impl PrescriptionService for InMemoryPrescriptionService {
    async fn create_prescription(&self, request: &PrescriptionRequest) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        state.create_faults.check(SERVICE, "create prescription")?;

        state.next_id += 1;
        let prescription_id = format!("RX-{:04}", state.next_id);
        state.active.insert(prescription_id.clone(), request.clone());
        Ok(prescription_id)
    }

    async fn cancel_prescription(&self, prescription_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        state.cancel_faults.check(SERVICE, "cancel prescription")?;

        if state.active.remove(prescription_id).is_some() {
            state.cancelled.push(prescription_id.to_string());
        }
        Ok(())
    }
}
