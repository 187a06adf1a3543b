//! Order fulfillment steps and the job handler that runs them.
//!
//! Every step is a job on [`QUEUE`]. A step performs one collaborator call
//! and records its outcome on the order's saga; the dispatcher reacts to the
//! persisted event and enqueues whatever runs next.

use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, CorrelationId, PatientId};
use domain::{DomainError, EventContext, Repository};
use event_store::{EventStore, StoredEvent};
use messaging::{Job, JobError, JobHandler};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::order_fulfillment::{
    self, OrderFulfillmentEvent, OrderFulfillmentSaga, OrderFulfillmentState, StepFailure,
};
use crate::services::{
    InventoryService, PrescriptionRequest, PrescriptionService, ServiceError, ShipmentRequest,
    ShipmentService,
};
use crate::state_machine::{Saga, record_transition_metrics};

/// Queue every order fulfillment step runs on.
pub const QUEUE: &str = "order-fulfillment";

/// In-job attempts at writing or delivering a step outcome before the job
/// itself is failed.
const RECORD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CreatePrescription,
    ReserveInventory,
    InitiateShipment,
    ReleaseInventory,
    CancelPrescription,
    CancelOrder,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::CreatePrescription,
        Step::ReserveInventory,
        Step::InitiateShipment,
        Step::ReleaseInventory,
        Step::CancelPrescription,
        Step::CancelOrder,
    ];

    pub fn job_name(&self) -> &'static str {
        match self {
            Step::CreatePrescription => "create_prescription",
            Step::ReserveInventory => "reserve_inventory",
            Step::InitiateShipment => "initiate_shipment",
            Step::ReleaseInventory => "release_inventory",
            Step::CancelPrescription => "cancel_prescription",
            Step::CancelOrder => "cancel_order",
        }
    }

    pub fn from_job_name(name: &str) -> Option<Step> {
        Step::ALL.into_iter().find(|step| step.job_name() == name)
    }

    /// True for steps that undo an earlier step.
    pub fn is_compensation(&self) -> bool {
        matches!(
            self,
            Step::ReleaseInventory | Step::CancelPrescription | Step::CancelOrder
        )
    }

    /// True while the saga still waits for this step's outcome. A redelivered
    /// job whose outcome is already recorded is not pending.
    pub fn is_pending(&self, saga: &OrderFulfillmentSaga) -> bool {
        use OrderFulfillmentState::*;
        match (self, saga.state()) {
            (Step::CreatePrescription, Some(Created)) => true,
            (Step::ReserveInventory, Some(PrescriptionCreated)) => true,
            (Step::InitiateShipment, Some(InventoryReserved)) => true,
            (Step::ReleaseInventory, Some(Compensating)) => !saga.is_inventory_released(),
            (Step::CancelPrescription, Some(Compensating)) => !saga.is_prescription_cancelled(),
            (Step::CancelOrder, Some(Compensating)) => true,
            _ => false,
        }
    }
}

impl Step {
    /// Event types a completed run of this step leaves on the saga.
    pub fn outcomes(&self) -> &'static [&'static str] {
        match self {
            Step::CreatePrescription => &[
                order_fulfillment::PRESCRIPTION_CREATED,
                order_fulfillment::PRESCRIPTION_FAILED,
            ],
            Step::ReserveInventory => &[
                order_fulfillment::INVENTORY_RESERVED,
                order_fulfillment::INVENTORY_RESERVATION_FAILED,
            ],
            Step::InitiateShipment => &[
                order_fulfillment::SHIPMENT_INITIATED,
                order_fulfillment::SHIPMENT_FAILED,
            ],
            Step::ReleaseInventory => &[order_fulfillment::INVENTORY_RELEASED],
            Step::CancelPrescription => &[order_fulfillment::PRESCRIPTION_CANCELLED],
            Step::CancelOrder => &[order_fulfillment::ORDER_CANCELLED],
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.job_name())
    }
}

/// Job payload of a step.
///
/// Identifiers are optional on the wire; each step checks the ones it needs
/// and fails permanently when one is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub order_id: Option<AggregateId>,
    pub patient_id: Option<PatientId>,
    pub medication: Option<String>,
    pub quantity: Option<u32>,
    pub shipping_address: Option<String>,
    pub prescription_id: Option<String>,
    pub reservation_id: Option<String>,
    pub reason: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    /// Event that caused the step to be enqueued.
    pub causation_id: Option<String>,
}

impl StepInput {
    /// Builds the input of `step` from the saga's state after `cause` was stored.
    pub fn for_step(step: Step, saga: &OrderFulfillmentSaga, cause: &StoredEvent) -> Self {
        let details = saga.details();
        let mut input = StepInput {
            order_id: Some(cause.aggregate_id()),
            correlation_id: cause.event.correlation_id(),
            causation_id: Some(cause.event.event_id.to_string()),
            ..Default::default()
        };

        match step {
            Step::CreatePrescription | Step::ReserveInventory => {
                input.patient_id = details.map(|d| d.patient_id);
                input.medication = details.map(|d| d.medication.clone());
                input.quantity = details.map(|d| d.quantity);
                input.prescription_id = saga.prescription_id().map(str::to_string);
            }
            Step::InitiateShipment => {
                input.reservation_id = saga.reservation_id().map(str::to_string);
                input.shipping_address = details.map(|d| d.shipping_address.clone());
            }
            Step::ReleaseInventory => {
                input.reservation_id = saga.reservation_id().map(str::to_string);
            }
            Step::CancelPrescription => {
                input.prescription_id = saga.prescription_id().map(str::to_string);
            }
            Step::CancelOrder => {
                input.reason = Some(
                    saga.failure()
                        .map(|f| f.error.clone())
                        .unwrap_or_else(|| "order fulfillment failed".to_string()),
                );
            }
        }
        input
    }

    fn context(&self, step: Step) -> EventContext {
        let mut context = EventContext::new(step.job_name());
        if let Some(correlation_id) = self.correlation_id {
            context = context.with_correlation_id(correlation_id);
        }
        if let Some(causation_id) = &self.causation_id {
            context = context.with_causation_id(causation_id);
        }
        context
    }
}

fn require<T: Clone>(field: &Option<T>, name: &str) -> std::result::Result<T, JobError> {
    field
        .clone()
        .ok_or_else(|| JobError::permanent(format!("missing required field {name}")))
}

/// External services the steps call.
#[derive(Clone)]
pub struct Collaborators {
    pub prescriptions: Arc<dyn PrescriptionService>,
    pub inventory: Arc<dyn InventoryService>,
    pub shipments: Arc<dyn ShipmentService>,
}

/// Runs every [`Step`], routed by job name.
pub struct StepExecutor<S>
where
    S: EventStore,
{
    sagas: Repository<S, OrderFulfillmentSaga>,
    collaborators: Collaborators,
}

impl<S> StepExecutor<S>
where
    S: EventStore,
{
    pub fn new(sagas: Repository<S, OrderFulfillmentSaga>, collaborators: Collaborators) -> Self {
        Self {
            sagas,
            collaborators,
        }
    }

    #[tracing::instrument(
        skip(self, step, job),
        fields(job_id = %job.id, step = %step, attempt = job.attempt)
    )]
    async fn run(&self, step: Step, job: &Job) -> std::result::Result<(), JobError> {
        let input: StepInput = job
            .payload_as()
            .map_err(|e| JobError::permanent(format!("malformed step input: {e}")))?;
        let order_id = require(&input.order_id, "order_id")?;

        let saga = self.sagas.get(order_id).await.map_err(|e| match e {
            DomainError::AggregateNotFound { .. } => JobError::permanent(e.to_string()),
            other => JobError::transient(other.to_string()),
        })?;
        if !step.is_pending(saga.state()) {
            tracing::info!(%order_id, "step outcome already recorded");
            return self.redeliver(step, job, order_id).await;
        }

        let context = input.context(step);
        match step {
            Step::CreatePrescription => {
                let request = PrescriptionRequest {
                    order_id,
                    patient_id: require(&input.patient_id, "patient_id")?,
                    medication: require(&input.medication, "medication")?,
                    quantity: require(&input.quantity, "quantity")?,
                };
                match self.collaborators.prescriptions.create_prescription(&request).await {
                    Ok(prescription_id) => {
                        tracing::info!(%order_id, %prescription_id, "prescription created");
                        self.record(step, job, order_id, &context, |s| {
                            s.record_prescription_created(prescription_id.clone())
                        })
                        .await
                    }
                    Err(err) => {
                        self.forward_failure(step, job, order_id, &context, err, |s, f| {
                            s.record_prescription_failed(f)
                        })
                        .await
                    }
                }
            }
            Step::ReserveInventory => {
                let medication = require(&input.medication, "medication")?;
                let quantity = require(&input.quantity, "quantity")?;
                match self
                    .collaborators
                    .inventory
                    .reserve(order_id, &medication, quantity)
                    .await
                {
                    Ok(reservation_id) => {
                        tracing::info!(%order_id, %reservation_id, "inventory reserved");
                        self.record(step, job, order_id, &context, |s| {
                            s.record_inventory_reserved(reservation_id.clone())
                        })
                        .await
                    }
                    Err(err) => {
                        self.forward_failure(step, job, order_id, &context, err, |s, f| {
                            s.record_inventory_reservation_failed(f)
                        })
                        .await
                    }
                }
            }
            Step::InitiateShipment => {
                let request = ShipmentRequest {
                    order_id,
                    reservation_id: require(&input.reservation_id, "reservation_id")?,
                    shipping_address: require(&input.shipping_address, "shipping_address")?,
                };
                match self.collaborators.shipments.initiate_shipment(&request).await {
                    Ok(shipment_id) => {
                        tracing::info!(%order_id, %shipment_id, "shipment initiated");
                        self.record(step, job, order_id, &context, |s| {
                            s.record_shipment_initiated(shipment_id.clone())
                        })
                        .await
                    }
                    Err(err) => {
                        self.forward_failure(step, job, order_id, &context, err, |s, f| {
                            s.record_shipment_failed(f)
                        })
                        .await
                    }
                }
            }
            Step::ReleaseInventory => {
                let reservation_id = require(&input.reservation_id, "reservation_id")?;
                match self.collaborators.inventory.release(&reservation_id).await {
                    Ok(()) => {
                        tracing::info!(%order_id, %reservation_id, "inventory released");
                        self.record(step, job, order_id, &context, |s| {
                            s.record_inventory_released()
                        })
                        .await
                    }
                    Err(err) => Err(compensation_failure(step, job, order_id, err)),
                }
            }
            Step::CancelPrescription => {
                let prescription_id = require(&input.prescription_id, "prescription_id")?;
                match self
                    .collaborators
                    .prescriptions
                    .cancel_prescription(&prescription_id)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(%order_id, %prescription_id, "prescription cancelled");
                        self.record(step, job, order_id, &context, |s| {
                            s.record_prescription_cancelled()
                        })
                        .await
                    }
                    Err(err) => Err(compensation_failure(step, job, order_id, err)),
                }
            }
            Step::CancelOrder => {
                let reason = require(&input.reason, "reason")?;
                tracing::info!(%order_id, %reason, "order cancelled");
                self.record(step, job, order_id, &context, |s| s.cancel(reason.as_str()))
                    .await
            }
        }
    }

    /// Records a step outcome on the saga.
    ///
    /// Store errors and version conflicts are retried in place. Once the
    /// outcome is stored it must reach the dispatcher, so a failed
    /// publication is redelivered rather than dropped. When neither works
    /// out the job fails, and on its last attempt the loss is logged and
    /// counted.
    async fn record<F>(
        &self,
        step: Step,
        job: &Job,
        order_id: AggregateId,
        context: &EventContext,
        decide: F,
    ) -> std::result::Result<(), JobError>
    where
        F: Fn(&OrderFulfillmentSaga) -> Result<Vec<OrderFulfillmentEvent>>,
    {
        let mut last_error = None;
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.sagas.execute(order_id, context, &decide).await {
                Ok(result) => {
                    record_transition_metrics(&result.events);
                    return Ok(());
                }
                Err(SagaError::Domain(DomainError::Publication(e))) => {
                    tracing::warn!(%order_id, %step, error = %e, "step outcome stored but not delivered");
                    return self.redeliver(step, job, order_id).await;
                }
                Err(e @ SagaError::Domain(_)) => {
                    tracing::warn!(%order_id, %step, attempt, error = %e, "recording step outcome failed");
                    last_error = Some(e);
                    // A concurrent run of this step may have recorded it.
                    if let Ok(saga) = self.sagas.get(order_id).await
                        && !step.is_pending(saga.state())
                    {
                        return self.redeliver(step, job, order_id).await;
                    }
                }
                Err(e) => return Err(JobError::permanent(e.to_string())),
            }
        }

        let reason = last_error.map_or_else(String::new, |e| e.to_string());
        if job.is_final_attempt() {
            tracing::error!(%order_id, %step, error = %reason, "step outcome could not be recorded");
            metrics::counter!("unrecorded_step_outcomes_total", "step" => step.job_name())
                .increment(1);
        }
        Err(JobError::transient(reason))
    }

    /// Publishes the saga's latest event again if it is this step's outcome,
    /// so the dispatcher enqueues what runs next. A saga that has moved on
    /// past this step needs nothing.
    async fn redeliver(
        &self,
        step: Step,
        job: &Job,
        order_id: AggregateId,
    ) -> std::result::Result<(), JobError> {
        let mut last_error = None;
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.sagas.republish_latest(order_id, step.outcomes()).await {
                Ok(Some(event)) => {
                    tracing::info!(%order_id, %step, event_type = event.event_type(), "step outcome delivered");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!(%order_id, %step, attempt, error = %e, "delivering step outcome failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error.map_or_else(String::new, |e| e.to_string());
        if job.is_final_attempt() {
            tracing::error!(%order_id, %step, error = %reason, "step outcome stored but never delivered");
            metrics::counter!("undelivered_step_outcomes_total", "step" => step.job_name())
                .increment(1);
        }
        Err(JobError::transient(reason))
    }

    /// Handles a failed forward step. Retryable failures are retried until the
    /// last attempt; only then, or when the collaborator rejected the request,
    /// the failure event is recorded and compensation starts.
    async fn forward_failure<F>(
        &self,
        step: Step,
        job: &Job,
        order_id: AggregateId,
        context: &EventContext,
        err: ServiceError,
        decide: F,
    ) -> std::result::Result<(), JobError>
    where
        F: Fn(&OrderFulfillmentSaga, StepFailure) -> Result<Vec<OrderFulfillmentEvent>>,
    {
        if err.is_retryable() && !job.is_final_attempt() {
            tracing::warn!(%order_id, error = %err, "step failed, will retry");
            return Err(JobError::transient(err.to_string()));
        }

        let failure = StepFailure {
            error: err.to_string(),
            input: job.payload.clone(),
        };
        self.record(step, job, order_id, context, |s| decide(s, failure.clone()))
            .await?;
        tracing::warn!(%order_id, %step, error = %err, "step failed, compensating");

        if err.is_retryable() {
            Err(JobError::transient(err.to_string()))
        } else {
            Err(JobError::permanent(err.to_string()))
        }
    }
}

/// A failed compensation is retried like any step. Once it cannot be retried
/// any more it is only logged and counted.
fn compensation_failure(step: Step, job: &Job, order_id: AggregateId, err: ServiceError) -> JobError {
    if err.is_retryable() && !job.is_final_attempt() {
        tracing::warn!(%order_id, %step, error = %err, "compensation failed, will retry");
        return JobError::transient(err.to_string());
    }

    tracing::error!(%order_id, %step, error = %err, "compensation step exhausted its attempts");
    metrics::counter!("compensation_failures_total", "step" => step.job_name()).increment(1);
    if err.is_retryable() {
        JobError::transient(err.to_string())
    } else {
        JobError::permanent(err.to_string())
    }
}

#[async_trait]
impl<S> JobHandler for StepExecutor<S>
where
    S: EventStore,
{
    async fn handle(&self, job: &Job) -> std::result::Result<(), JobError> {
        let step = Step::from_job_name(&job.name)
            .ok_or_else(|| JobError::permanent(format!("unknown step {}", job.name)))?;
        self.run(step, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_fulfillment::OrderDetails;
    use crate::services::{InMemoryInventoryService, InMemoryPrescriptionService, InMemoryShipmentService};
    use common::Money;
    use event_store::InMemoryEventStore;
    use messaging::{InMemoryEventBus, RetryPolicy};

    struct Fixture {
        sagas: Repository<InMemoryEventStore, OrderFulfillmentSaga>,
        bus: Arc<InMemoryEventBus>,
        prescriptions: Arc<InMemoryPrescriptionService>,
        inventory: Arc<InMemoryInventoryService>,
        executor: StepExecutor<InMemoryEventStore>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryEventBus::new());
        let sagas = Repository::new(InMemoryEventStore::new(), bus.clone());
        let prescriptions = Arc::new(InMemoryPrescriptionService::new());
        let inventory = Arc::new(InMemoryInventoryService::new());
        let collaborators = Collaborators {
            prescriptions: prescriptions.clone(),
            inventory: inventory.clone(),
            shipments: Arc::new(InMemoryShipmentService::new()),
        };
        Fixture {
            executor: StepExecutor::new(sagas.clone(), collaborators),
            sagas,
            bus,
            prescriptions,
            inventory,
        }
    }

    async fn create_order(sagas: &Repository<InMemoryEventStore, OrderFulfillmentSaga>) -> StoredEvent {
        let details = OrderDetails {
            patient_id: PatientId::new(),
            medication: "metformin".into(),
            quantity: 2,
            shipping_address: "5 Elm St".into(),
            amount: Money::from_cents(4_500),
        };
        let result = sagas
            .execute(AggregateId::new(), &EventContext::new("test"), |s: &OrderFulfillmentSaga| {
                s.start(details)
            })
            .await
            .unwrap();
        result.events[0].clone()
    }

    async fn job_for(
        sagas: &Repository<InMemoryEventStore, OrderFulfillmentSaga>,
        step: Step,
        cause: &StoredEvent,
        attempt: u32,
    ) -> Job {
        let saga = sagas.get(cause.aggregate_id()).await.unwrap();
        let input = StepInput::for_step(step, saga.state(), cause);
        let mut job = Job::with_payload(QUEUE, step.job_name(), &input)
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate(3));
        job.attempt = attempt;
        job
    }

    #[test]
    fn job_names_round_trip() {
        for step in Step::ALL {
            assert_eq!(Step::from_job_name(step.job_name()), Some(step));
        }
        assert_eq!(Step::from_job_name("charge_card"), None);
        assert!(Step::CancelOrder.is_compensation());
        assert!(!Step::InitiateShipment.is_compensation());
    }

    #[tokio::test]
    async fn successful_step_records_outcome() {
        let f = fixture();
        let created = create_order(&f.sagas).await;
        let job = job_for(&f.sagas, Step::CreatePrescription, &created, 1).await;

        f.executor.handle(&job).await.unwrap();

        let saga = f.sagas.get(created.aggregate_id()).await.unwrap();
        assert_eq!(saga.state().state(), Some(OrderFulfillmentState::PrescriptionCreated));
        assert_eq!(saga.state().prescription_id(), Some("RX-0001"));
    }

    #[tokio::test]
    async fn redelivered_step_republishes_its_outcome() {
        let f = fixture();
        let created = create_order(&f.sagas).await;
        let job = job_for(&f.sagas, Step::CreatePrescription, &created, 1).await;

        f.executor.handle(&job).await.unwrap();
        f.executor.handle(&job).await.unwrap();

        assert_eq!(f.prescriptions.create_calls().await, 1);
        assert_eq!(f.sagas.history(created.aggregate_id()).await.unwrap().len(), 3);
        assert_eq!(f.bus.events_of_type("PrescriptionCreated").await.len(), 2);
    }

    #[tokio::test]
    async fn stale_step_after_the_saga_moved_on_publishes_nothing() {
        let f = fixture();
        let created = create_order(&f.sagas).await;
        let order_id = created.aggregate_id();
        let job = job_for(&f.sagas, Step::CreatePrescription, &created, 1).await;
        let ctx = EventContext::new("test");
        f.sagas.execute(order_id, &ctx, |s| s.record_prescription_created("RX-1".into())).await.unwrap();
        f.sagas.execute(order_id, &ctx, |s| s.record_inventory_reserved("RES-1".into())).await.unwrap();
        let published = f.bus.event_count().await;

        f.executor.handle(&job).await.unwrap();

        assert_eq!(f.prescriptions.create_calls().await, 0);
        assert_eq!(f.bus.event_count().await, published);
    }

    #[test]
    fn outcomes_are_the_events_that_trigger_the_next_step() {
        for step in Step::ALL {
            for event_type in step.outcomes() {
                let next = crate::dispatcher::next_step(event_type);
                match (step, *event_type) {
                    (Step::InitiateShipment, order_fulfillment::SHIPMENT_INITIATED)
                    | (Step::CancelOrder, _) => assert_eq!(next, None),
                    _ => assert!(next.is_some(), "{event_type} starts no step"),
                }
            }
        }
    }

    #[tokio::test]
    async fn missing_identifier_is_permanent() {
        let f = fixture();
        let job = Job::with_payload(QUEUE, Step::CreatePrescription.job_name(), &StepInput::default())
            .unwrap();

        let err = f.executor.handle(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Permanent(ref m) if m.contains("order_id")));
    }

    #[tokio::test]
    async fn unknown_step_is_permanent() {
        let f = fixture();
        let job = Job::new(QUEUE, "refund_payment", serde_json::json!({}));
        assert!(matches!(
            f.executor.handle(&job).await,
            Err(JobError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn failure_before_last_attempt_records_nothing() {
        let f = fixture();
        f.prescriptions.fail_create_always().await;
        let created = create_order(&f.sagas).await;
        let job = job_for(&f.sagas, Step::CreatePrescription, &created, 1).await;

        let err = f.executor.handle(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Transient(_)));
        let saga = f.sagas.get(created.aggregate_id()).await.unwrap();
        assert_eq!(saga.state().state(), Some(OrderFulfillmentState::Created));
    }

    #[tokio::test]
    async fn failure_on_last_attempt_records_failure_event() {
        let f = fixture();
        f.prescriptions.fail_create_always().await;
        let created = create_order(&f.sagas).await;
        let job = job_for(&f.sagas, Step::CreatePrescription, &created, 3).await;

        let err = f.executor.handle(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Transient(_)));
        let saga = f.sagas.get(created.aggregate_id()).await.unwrap();
        assert_eq!(saga.state().state(), Some(OrderFulfillmentState::Compensating));
        let failure = saga.state().failure().unwrap();
        assert_eq!(failure.input, job.payload);
    }

    #[tokio::test]
    async fn rejection_fails_immediately() {
        let f = fixture();
        f.prescriptions.reject_create().await;
        let created = create_order(&f.sagas).await;
        let job = job_for(&f.sagas, Step::CreatePrescription, &created, 1).await;

        let err = f.executor.handle(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Permanent(_)));
        let saga = f.sagas.get(created.aggregate_id()).await.unwrap();
        assert_eq!(saga.state().state(), Some(OrderFulfillmentState::Compensating));
    }

    #[tokio::test]
    async fn exhausted_compensation_records_nothing() {
        let f = fixture();
        f.inventory.fail_release_always().await;
        let created = create_order(&f.sagas).await;
        let order_id = created.aggregate_id();
        let ctx = EventContext::new("test");
        f.sagas.execute(order_id, &ctx, |s| s.record_prescription_created("RX-1".into())).await.unwrap();
        f.sagas.execute(order_id, &ctx, |s| s.record_inventory_reserved("RES-1".into())).await.unwrap();
        let failed = f
            .sagas
            .execute(order_id, &ctx, |s| {
                s.record_shipment_failed(StepFailure {
                    error: "carrier down".into(),
                    input: serde_json::Value::Null,
                })
            })
            .await
            .unwrap();
        let cause = failed.events.last().unwrap().clone();
        let job = job_for(&f.sagas, Step::ReleaseInventory, &cause, 3).await;
        let before = f.sagas.history(order_id).await.unwrap().len();

        assert!(matches!(
            f.executor.handle(&job).await,
            Err(JobError::Transient(_))
        ));
        assert_eq!(f.sagas.history(order_id).await.unwrap().len(), before);
        assert_eq!(f.inventory.release_calls().await, 1);
    }
}
