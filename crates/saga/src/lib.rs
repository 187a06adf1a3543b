//! Saga orchestration for the telemedicine workflows.
//!
//! Three event-sourced sagas share one transition-table state machine:
//! - [`OrderFulfillmentSaga`]: prescription, inventory and shipment steps,
//!   compensated in reverse when one of them fails
//! - [`SubscriptionRenewalSaga`]: payment method check and payment attempt
//! - [`DunningSaga`]: scheduled payment retries with escalation
//!
//! Order fulfillment steps run as jobs. The [`StepExecutor`] performs a step
//! and records its outcome; the [`StepDispatcher`] reacts to the stored event
//! and enqueues the next step.

pub mod dispatcher;
pub mod dunning;
pub mod error;
pub mod order_fulfillment;
pub mod runtime;
pub mod services;
pub mod state_machine;
pub mod steps;
pub mod subscription_renewal;
pub mod workflows;

pub use dispatcher::{DunningTrigger, StepDispatcher, next_step};
pub use dunning::{DunningEvent, DunningSaga, DunningState, EscalationAction, NotificationChannel};
pub use error::{Result, SagaError};
pub use order_fulfillment::{
    OrderDetails, OrderFulfillmentEvent, OrderFulfillmentSaga, OrderFulfillmentState, StepFailure,
};
pub use runtime::SagaRuntime;
pub use services::{
    InMemoryInventoryService, InMemoryPrescriptionService, InMemoryShipmentService,
    InventoryService, PrescriptionRequest, PrescriptionService, ServiceError, ShipmentRequest,
    ShipmentService,
};
pub use state_machine::{Saga, SagaState, Transition};
pub use steps::{Collaborators, Step, StepExecutor, StepInput};
pub use subscription_renewal::{
    PaymentOutcome, RenewalEvent, RenewalState, SubscriptionRenewalSaga,
};
pub use workflows::WorkflowService;
