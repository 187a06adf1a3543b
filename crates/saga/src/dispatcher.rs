//! Event handlers that move sagas forward.

use std::sync::Arc;

use async_trait::async_trait;
use domain::{EventContext, Repository};
use event_store::{EventStore, StoredEvent};
use messaging::{EventHandler, Job, JobQueue, MessagingError, RetryPolicy};

use crate::dunning::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_SCHEDULE, DunningSaga};
use crate::error::SagaError;
use crate::order_fulfillment::{self, OrderFulfillmentSaga};
use crate::state_machine::record_transition_metrics;
use crate::steps::{QUEUE, Step, StepInput};
use crate::subscription_renewal::{RENEWAL_FAILED, RenewalEvent};

/// Event types that start a step.
pub const STEP_TRIGGERS: [&str; 8] = [
    order_fulfillment::ORDER_CREATED,
    order_fulfillment::PRESCRIPTION_CREATED,
    order_fulfillment::INVENTORY_RESERVED,
    order_fulfillment::SHIPMENT_FAILED,
    order_fulfillment::INVENTORY_RELEASED,
    order_fulfillment::INVENTORY_RESERVATION_FAILED,
    order_fulfillment::PRESCRIPTION_FAILED,
    order_fulfillment::PRESCRIPTION_CANCELLED,
];

/// The step that runs after an order fulfillment event, if any.
pub fn next_step(event_type: &str) -> Option<Step> {
    match event_type {
        order_fulfillment::ORDER_CREATED => Some(Step::CreatePrescription),
        order_fulfillment::PRESCRIPTION_CREATED => Some(Step::ReserveInventory),
        order_fulfillment::INVENTORY_RESERVED => Some(Step::InitiateShipment),
        order_fulfillment::SHIPMENT_FAILED => Some(Step::ReleaseInventory),
        order_fulfillment::INVENTORY_RELEASED
        | order_fulfillment::INVENTORY_RESERVATION_FAILED => Some(Step::CancelPrescription),
        order_fulfillment::PRESCRIPTION_FAILED | order_fulfillment::PRESCRIPTION_CANCELLED => {
            Some(Step::CancelOrder)
        }
        _ => None,
    }
}

fn handler_error(e: impl std::fmt::Display) -> MessagingError {
    MessagingError::Handler(e.to_string())
}

/// Enqueues the next order fulfillment step for each trigger event.
pub struct StepDispatcher<S>
where
    S: EventStore,
{
    sagas: Repository<S, OrderFulfillmentSaga>,
    queue: Arc<dyn JobQueue>,
    retry_policy: RetryPolicy,
}

impl<S> StepDispatcher<S>
where
    S: EventStore,
{
    pub fn new(
        sagas: Repository<S, OrderFulfillmentSaga>,
        queue: Arc<dyn JobQueue>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            sagas,
            queue,
            retry_policy,
        }
    }
}

#[async_trait]
impl<S> EventHandler for StepDispatcher<S>
where
    S: EventStore,
{
    fn name(&self) -> &'static str {
        "StepDispatcher"
    }

    async fn handle(&self, event: &StoredEvent) -> messaging::Result<()> {
        if event.aggregate_type() != order_fulfillment::SAGA_TYPE {
            return Ok(());
        }
        let Some(step) = next_step(event.event_type()) else {
            return Ok(());
        };

        let order_id = event.aggregate_id();
        let saga = self.sagas.get(order_id).await.map_err(handler_error)?;
        let input = StepInput::for_step(step, saga.state(), event);
        let job = Job::with_payload(QUEUE, step.job_name(), &input)?.with_retry_policy(self.retry_policy);
        let job_id = self.queue.enqueue(job).await?;

        tracing::debug!(
            %order_id,
            %step,
            %job_id,
            trigger = event.event_type(),
            "step enqueued"
        );
        Ok(())
    }
}

/// Starts a dunning saga when a subscription renewal fails.
pub struct DunningTrigger<S>
where
    S: EventStore,
{
    dunning: Repository<S, DunningSaga>,
}

impl<S> DunningTrigger<S>
where
    S: EventStore,
{
    pub fn new(dunning: Repository<S, DunningSaga>) -> Self {
        Self { dunning }
    }
}

#[async_trait]
impl<S> EventHandler for DunningTrigger<S>
where
    S: EventStore,
{
    fn name(&self) -> &'static str {
        "DunningTrigger"
    }

    async fn handle(&self, event: &StoredEvent) -> messaging::Result<()> {
        if event.event_type() != RENEWAL_FAILED {
            return Ok(());
        }
        let RenewalEvent::Failed {
            subscription_id,
            dunning_saga_id,
            ..
        } = event.event.payload_as::<RenewalEvent>()?
        else {
            return Err(MessagingError::Handler(format!(
                "{RENEWAL_FAILED} payload has the wrong shape"
            )));
        };

        let context = EventContext::caused_by("dunning_trigger", event);
        let result = self
            .dunning
            .execute(dunning_saga_id, &context, |s: &DunningSaga| {
                s.start(
                    subscription_id,
                    DEFAULT_RETRY_SCHEDULE.to_vec(),
                    DEFAULT_MAX_ATTEMPTS,
                )
            })
            .await;

        match result {
            Ok(result) => {
                record_transition_metrics(&result.events);
                tracing::info!(%subscription_id, %dunning_saga_id, "dunning started after failed renewal");
                Ok(())
            }
            Err(SagaError::AlreadyStarted { .. }) => {
                tracing::debug!(%dunning_saga_id, "dunning already started");
                Ok(())
            }
            Err(e) => Err(handler_error(e)),
        }
    }
}
