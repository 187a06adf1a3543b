//! Order fulfillment saga.
//!
//! ```text
//! Created ──► PrescriptionCreated ──► InventoryReserved ──► Shipped
//!    │               │                       │
//!    └───────────────┴───────────────────────┴──► Compensating ──► Cancelled
//! ```
//!
//! Forward steps and compensations are run by the step executor; this
//! aggregate only decides which events each outcome produces.

use common::{Money, PatientId};
use domain::{Aggregate, DomainEvent};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state_machine::{Saga, SagaState, TRANSITIONED, Transition};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillmentSaga";

pub const ORDER_CREATED: &str = "OrderCreated";
pub const PRESCRIPTION_CREATED: &str = "PrescriptionCreated";
pub const PRESCRIPTION_FAILED: &str = "PrescriptionFailed";
pub const INVENTORY_RESERVED: &str = "InventoryReserved";
pub const INVENTORY_RESERVATION_FAILED: &str = "InventoryReservationFailed";
pub const SHIPMENT_INITIATED: &str = "ShipmentInitiated";
pub const SHIPMENT_FAILED: &str = "ShipmentFailed";
pub const INVENTORY_RELEASED: &str = "InventoryReleased";
pub const PRESCRIPTION_CANCELLED: &str = "PrescriptionCancelled";
pub const ORDER_CANCELLED: &str = "OrderCancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFulfillmentState {
    Created,
    PrescriptionCreated,
    InventoryReserved,
    /// Terminal.
    Shipped,
    Compensating,
    /// Terminal.
    Cancelled,
}

impl SagaState for OrderFulfillmentState {
    fn allowed_transitions(&self) -> &'static [Self] {
        use OrderFulfillmentState::*;
        match self {
            Created => &[PrescriptionCreated, Compensating],
            PrescriptionCreated => &[InventoryReserved, Compensating],
            InventoryReserved => &[Shipped, Compensating],
            Compensating => &[Cancelled],
            Shipped | Cancelled => &[],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            OrderFulfillmentState::Created => "created",
            OrderFulfillmentState::PrescriptionCreated => "prescription_created",
            OrderFulfillmentState::InventoryReserved => "inventory_reserved",
            OrderFulfillmentState::Shipped => "shipped",
            OrderFulfillmentState::Compensating => "compensating",
            OrderFulfillmentState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderFulfillmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business parameters of a medication order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub patient_id: PatientId,
    pub medication: String,
    pub quantity: u32,
    pub shipping_address: String,
    pub amount: Money,
}

/// Error and original input of a step that used up its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub error: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderFulfillmentEvent {
    OrderCreated(OrderDetails),
    Transitioned(Transition<OrderFulfillmentState>),
    PrescriptionCreated { prescription_id: String },
    PrescriptionFailed(StepFailure),
    InventoryReserved { reservation_id: String },
    InventoryReservationFailed(StepFailure),
    ShipmentInitiated { shipment_id: String },
    ShipmentFailed(StepFailure),
    InventoryReleased { reservation_id: String },
    PrescriptionCancelled { prescription_id: String },
    OrderCancelled { reason: String },
}

impl DomainEvent for OrderFulfillmentEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        ORDER_CREATED,
        TRANSITIONED,
        PRESCRIPTION_CREATED,
        PRESCRIPTION_FAILED,
        INVENTORY_RESERVED,
        INVENTORY_RESERVATION_FAILED,
        SHIPMENT_INITIATED,
        SHIPMENT_FAILED,
        INVENTORY_RELEASED,
        PRESCRIPTION_CANCELLED,
        ORDER_CANCELLED,
    ];

    fn event_type(&self) -> &'static str {
        match self {
            OrderFulfillmentEvent::OrderCreated(_) => ORDER_CREATED,
            OrderFulfillmentEvent::Transitioned(_) => TRANSITIONED,
            OrderFulfillmentEvent::PrescriptionCreated { .. } => PRESCRIPTION_CREATED,
            OrderFulfillmentEvent::PrescriptionFailed(_) => PRESCRIPTION_FAILED,
            OrderFulfillmentEvent::InventoryReserved { .. } => INVENTORY_RESERVED,
            OrderFulfillmentEvent::InventoryReservationFailed(_) => INVENTORY_RESERVATION_FAILED,
            OrderFulfillmentEvent::ShipmentInitiated { .. } => SHIPMENT_INITIATED,
            OrderFulfillmentEvent::ShipmentFailed(_) => SHIPMENT_FAILED,
            OrderFulfillmentEvent::InventoryReleased { .. } => INVENTORY_RELEASED,
            OrderFulfillmentEvent::PrescriptionCancelled { .. } => PRESCRIPTION_CANCELLED,
            OrderFulfillmentEvent::OrderCancelled { .. } => ORDER_CANCELLED,
        }
    }
}

/// Event-sourced state of one order's fulfillment. The saga id is the order id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFulfillmentSaga {
    state: Option<OrderFulfillmentState>,
    details: Option<OrderDetails>,
    prescription_id: Option<String>,
    reservation_id: Option<String>,
    shipment_id: Option<String>,
    inventory_released: bool,
    prescription_cancelled: bool,
    failure: Option<StepFailure>,
    cancellation_reason: Option<String>,
}

impl OrderFulfillmentSaga {
    pub fn details(&self) -> Option<&OrderDetails> {
        self.details.as_ref()
    }

    pub fn prescription_id(&self) -> Option<&str> {
        self.prescription_id.as_deref()
    }

    pub fn reservation_id(&self) -> Option<&str> {
        self.reservation_id.as_deref()
    }

    pub fn shipment_id(&self) -> Option<&str> {
        self.shipment_id.as_deref()
    }

    pub fn is_inventory_released(&self) -> bool {
        self.inventory_released
    }

    pub fn is_prescription_cancelled(&self) -> bool {
        self.prescription_cancelled
    }

    /// The step failure that sent the saga into compensation.
    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_ref()
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn start(&self, details: OrderDetails) -> Result<Vec<OrderFulfillmentEvent>> {
        self.require_not_started()?;
        if details.medication.trim().is_empty() {
            return Err(SagaError::InvalidInput("medication is required".into()));
        }
        if details.quantity == 0 {
            return Err(SagaError::InvalidInput("quantity must be positive".into()));
        }
        if details.shipping_address.trim().is_empty() {
            return Err(SagaError::InvalidInput("shipping address is required".into()));
        }
        if details.amount.cents() < 0 {
            return Err(SagaError::InvalidInput("amount cannot be negative".into()));
        }
        Ok(vec![OrderFulfillmentEvent::OrderCreated(details)])
    }

    pub fn record_prescription_created(
        &self,
        prescription_id: String,
    ) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition =
            self.transition_to(OrderFulfillmentState::PrescriptionCreated, "prescription_created")?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::PrescriptionCreated { prescription_id },
        ])
    }

    pub fn record_prescription_failed(
        &self,
        failure: StepFailure,
    ) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition =
            self.transition_to(OrderFulfillmentState::Compensating, "prescription_failed")?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::PrescriptionFailed(failure),
        ])
    }

    pub fn record_inventory_reserved(
        &self,
        reservation_id: String,
    ) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition =
            self.transition_to(OrderFulfillmentState::InventoryReserved, "inventory_reserved")?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::InventoryReserved { reservation_id },
        ])
    }

    pub fn record_inventory_reservation_failed(
        &self,
        failure: StepFailure,
    ) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition = self.transition_to(
            OrderFulfillmentState::Compensating,
            "inventory_reservation_failed",
        )?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::InventoryReservationFailed(failure),
        ])
    }

    pub fn record_shipment_initiated(
        &self,
        shipment_id: String,
    ) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition = self.transition_to(OrderFulfillmentState::Shipped, "shipment_initiated")?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::ShipmentInitiated { shipment_id },
        ])
    }

    pub fn record_shipment_failed(&self, failure: StepFailure) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition = self.transition_to(OrderFulfillmentState::Compensating, "shipment_failed")?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::ShipmentFailed(failure),
        ])
    }

    pub fn record_inventory_released(&self) -> Result<Vec<OrderFulfillmentEvent>> {
        self.require_state(&[OrderFulfillmentState::Compensating], "release_inventory")?;
        if self.inventory_released {
            return Err(SagaError::InvalidInput("inventory already released".into()));
        }
        let reservation_id = self
            .reservation_id
            .clone()
            .ok_or_else(|| SagaError::InvalidInput("no reservation to release".into()))?;
        Ok(vec![OrderFulfillmentEvent::InventoryReleased { reservation_id }])
    }

    pub fn record_prescription_cancelled(&self) -> Result<Vec<OrderFulfillmentEvent>> {
        self.require_state(&[OrderFulfillmentState::Compensating], "cancel_prescription")?;
        if self.prescription_cancelled {
            return Err(SagaError::InvalidInput("prescription already cancelled".into()));
        }
        let prescription_id = self
            .prescription_id
            .clone()
            .ok_or_else(|| SagaError::InvalidInput("no prescription to cancel".into()))?;
        Ok(vec![OrderFulfillmentEvent::PrescriptionCancelled { prescription_id }])
    }

    /// Ends compensation.
    pub fn cancel(&self, reason: impl Into<String>) -> Result<Vec<OrderFulfillmentEvent>> {
        let transition = self.transition_to(OrderFulfillmentState::Cancelled, "cancel_order")?;
        Ok(vec![
            OrderFulfillmentEvent::Transitioned(transition),
            OrderFulfillmentEvent::OrderCancelled {
                reason: reason.into(),
            },
        ])
    }
}

impl Aggregate for OrderFulfillmentSaga {
    type Event = OrderFulfillmentEvent;

    fn aggregate_type() -> &'static str {
        SAGA_TYPE
    }

    fn apply(&mut self, event: &OrderFulfillmentEvent) {
        match event {
            OrderFulfillmentEvent::OrderCreated(details) => {
                self.details = Some(details.clone());
                self.state = Some(OrderFulfillmentState::Created);
            }
            OrderFulfillmentEvent::Transitioned(transition) => {
                self.state = Some(transition.to);
            }
            OrderFulfillmentEvent::PrescriptionCreated { prescription_id } => {
                self.prescription_id = Some(prescription_id.clone());
            }
            OrderFulfillmentEvent::InventoryReserved { reservation_id } => {
                self.reservation_id = Some(reservation_id.clone());
            }
            OrderFulfillmentEvent::ShipmentInitiated { shipment_id } => {
                self.shipment_id = Some(shipment_id.clone());
            }
            OrderFulfillmentEvent::PrescriptionFailed(failure)
            | OrderFulfillmentEvent::InventoryReservationFailed(failure)
            | OrderFulfillmentEvent::ShipmentFailed(failure) => {
                self.failure = Some(failure.clone());
            }
            OrderFulfillmentEvent::InventoryReleased { .. } => {
                self.inventory_released = true;
            }
            OrderFulfillmentEvent::PrescriptionCancelled { .. } => {
                self.prescription_cancelled = true;
            }
            OrderFulfillmentEvent::OrderCancelled { reason } => {
                self.cancellation_reason = Some(reason.clone());
            }
        }
    }
}

impl Saga for OrderFulfillmentSaga {
    type State = OrderFulfillmentState;

    fn state(&self) -> Option<OrderFulfillmentState> {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use domain::AggregateRoot;
    use OrderFulfillmentState::*;

    fn details() -> OrderDetails {
        OrderDetails {
            patient_id: PatientId::new(),
            medication: "semaglutide".to_string(),
            quantity: 4,
            shipping_address: "1 Main St".to_string(),
            amount: Money::from_cents(29_900),
        }
    }

    fn failure(error: &str) -> StepFailure {
        StepFailure {
            error: error.to_string(),
            input: serde_json::json!({"order_id": null}),
        }
    }

    fn started() -> AggregateRoot<OrderFulfillmentSaga> {
        let mut saga = AggregateRoot::new(AggregateId::new());
        saga.execute(|s: &OrderFulfillmentSaga| s.start(details())).unwrap();
        saga
    }

    #[test]
    fn transition_table() {
        assert!(Created.can_transition_to(PrescriptionCreated));
        assert!(Created.can_transition_to(Compensating));
        assert!(!Created.can_transition_to(InventoryReserved));
        assert!(!Created.can_transition_to(Shipped));
        assert!(InventoryReserved.can_transition_to(Shipped));
        assert!(!Compensating.can_transition_to(Created));
        assert!(Shipped.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Compensating.is_terminal());
    }

    #[test]
    fn start_sets_created() {
        let saga = started();
        assert_eq!(saga.state().state(), Some(Created));
        assert_eq!(saga.state().details().map(|d| d.quantity), Some(4));
    }

    #[test]
    fn start_twice_is_rejected() {
        let saga = started();
        assert!(matches!(
            saga.state().start(details()),
            Err(SagaError::AlreadyStarted { .. })
        ));
    }

    #[test]
    fn start_validates_details() {
        let saga = OrderFulfillmentSaga::default();
        let mut bad = details();
        bad.quantity = 0;
        assert!(matches!(saga.start(bad), Err(SagaError::InvalidInput(_))));
    }

    #[test]
    fn happy_path_reaches_shipped() {
        let mut saga = started();
        saga.execute(|s| s.record_prescription_created("RX-1".into())).unwrap();
        saga.execute(|s| s.record_inventory_reserved("RES-1".into())).unwrap();
        saga.execute(|s| s.record_shipment_initiated("SHP-1".into())).unwrap();

        let state = saga.state();
        assert_eq!(state.state(), Some(Shipped));
        assert_eq!(state.shipment_id(), Some("SHP-1"));
        assert!(state.is_finished());
    }

    #[test]
    fn skipping_a_step_is_an_invalid_transition() {
        let saga = started();
        let err = saga
            .state()
            .record_shipment_initiated("SHP-1".into())
            .unwrap_err();

        match err {
            SagaError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "created");
                assert_eq!(to, "shipped");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn compensation_path_after_shipment_failure() {
        let mut saga = started();
        saga.execute(|s| s.record_prescription_created("RX-1".into())).unwrap();
        saga.execute(|s| s.record_inventory_reserved("RES-1".into())).unwrap();
        saga.execute(|s| s.record_shipment_failed(failure("carrier down"))).unwrap();
        assert_eq!(saga.state().state(), Some(Compensating));

        saga.execute(|s| s.record_inventory_released()).unwrap();
        saga.execute(|s| s.record_prescription_cancelled()).unwrap();
        saga.execute(|s| s.cancel("shipment failed")).unwrap();

        let state = saga.state();
        assert_eq!(state.state(), Some(Cancelled));
        assert!(state.is_inventory_released());
        assert!(state.is_prescription_cancelled());
        assert_eq!(state.failure().map(|f| f.error.as_str()), Some("carrier down"));
    }

    #[test]
    fn compensation_steps_require_compensating_state() {
        let mut saga = started();
        saga.execute(|s| s.record_prescription_created("RX-1".into())).unwrap();

        assert!(matches!(
            saga.state().record_prescription_cancelled(),
            Err(SagaError::UnexpectedState { .. })
        ));
    }

    #[test]
    fn release_without_reservation_is_rejected() {
        let mut saga = started();
        saga.execute(|s| s.record_prescription_created("RX-1".into())).unwrap();
        saga.execute(|s| s.record_inventory_reservation_failed(failure("no stock")))
            .unwrap();

        assert!(matches!(
            saga.state().record_inventory_released(),
            Err(SagaError::InvalidInput(_))
        ));
    }

    #[test]
    fn cancelled_saga_rejects_everything() {
        let mut saga = started();
        saga.execute(|s| s.record_prescription_failed(failure("pharmacy down")))
            .unwrap();
        saga.execute(|s| s.cancel("prescription failed")).unwrap();

        assert!(saga.state().cancel("again").is_err());
        assert!(saga.state().record_prescription_created("RX-2".into()).is_err());
    }

    #[test]
    fn replay_reproduces_live_state() {
        let id = AggregateId::new();
        let mut live = AggregateRoot::<OrderFulfillmentSaga>::new(id);
        live.execute(|s| s.start(details())).unwrap();
        live.execute(|s| s.record_prescription_created("RX-1".into())).unwrap();
        live.execute(|s| s.record_inventory_reservation_failed(failure("no stock")))
            .unwrap();
        live.execute(|s| s.record_prescription_cancelled()).unwrap();

        let events = live.pending_events().to_vec();
        let replayed = AggregateRoot::<OrderFulfillmentSaga>::from_events(id, &events);

        assert_eq!(replayed.state(), live.state());
    }

    #[test]
    fn event_serialization_uses_type_tag() {
        let event = OrderFulfillmentEvent::InventoryReserved {
            reservation_id: "RES-1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "InventoryReserved");
        assert_eq!(json["data"]["reservation_id"], "RES-1");
        let back: OrderFulfillmentEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn transition_event_type_name() {
        let saga = started();
        let events = saga.state().record_prescription_created("RX-1".into()).unwrap();
        assert_eq!(events[0].event_type(), TRANSITIONED);
        assert_eq!(events[1].event_type(), PRESCRIPTION_CREATED);
    }
}
