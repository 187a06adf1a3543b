//! External collaborator traits and in-memory implementations for saga steps.

pub mod inventory;
pub mod prescription;
pub mod shipment;

use thiserror::Error;

pub use inventory::{InMemoryInventoryService, InventoryService};
pub use prescription::{InMemoryPrescriptionService, PrescriptionRequest, PrescriptionService};
pub use shipment::{InMemoryShipmentService, ShipmentRequest, ShipmentService};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The collaborator could not be reached or timed out.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    /// The collaborator refused the request; retrying will not help.
    #[error("{service} rejected the request: {reason}")]
    Rejected {
        service: &'static str,
        reason: String,
    },
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Unavailable { .. })
    }
}

/// Failure injection for one in-memory collaborator operation.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FaultPlan {
    remaining: u32,
    always: bool,
    reject: bool,
}

impl FaultPlan {
    pub(crate) fn fail_times(&mut self, times: u32) {
        *self = Self {
            remaining: times,
            ..Self::default()
        };
    }

    pub(crate) fn fail_always(&mut self) {
        *self = Self {
            always: true,
            ..Self::default()
        };
    }

    pub(crate) fn reject(&mut self) {
        *self = Self {
            always: true,
            reject: true,
            ..Self::default()
        };
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Consumes one planned failure, if any.
    pub(crate) fn check(&mut self, service: &'static str, operation: &str) -> Result<(), ServiceError> {
        if self.reject {
            return Err(ServiceError::Rejected {
                service,
                reason: format!("{operation} refused"),
            });
        }
        if self.always {
            return Err(ServiceError::Unavailable {
                service,
                reason: format!("{operation} timed out"),
            });
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return Err(ServiceError::Unavailable {
                service,
                reason: format!("{operation} timed out"),
            });
        }
        Ok(())
    }
}
