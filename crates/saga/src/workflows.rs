//! Command entry points for the three sagas.

use std::sync::Arc;

use chrono::Utc;
use common::{AggregateId, CorrelationId, Money, PatientId, SubscriptionId};
use domain::{Aggregate, AggregateRoot, EventContext, Repository};
use event_store::{EventStore, StoredEvent};
use messaging::EventBus;

use crate::dispatcher::STEP_TRIGGERS;
use crate::dunning::DunningSaga;
use crate::error::{Result, SagaError};
use crate::order_fulfillment::{OrderDetails, OrderFulfillmentSaga};
use crate::state_machine::record_transition_metrics;
use crate::subscription_renewal::{PaymentOutcome, RENEWAL_FAILED, SubscriptionRenewalSaga};

const SOURCE: &str = "workflow_service";

/// Starts sagas and runs their business operations.
///
/// Each operation loads the saga, decides, appends with a version check and
/// publishes the stored events.
pub struct WorkflowService<S>
where
    S: EventStore,
{
    orders: Repository<S, OrderFulfillmentSaga>,
    renewals: Repository<S, SubscriptionRenewalSaga>,
    dunning: Repository<S, DunningSaga>,
}

impl<S> Clone for WorkflowService<S>
where
    S: EventStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            orders: self.orders.clone(),
            renewals: self.renewals.clone(),
            dunning: self.dunning.clone(),
        }
    }
}

impl<S> WorkflowService<S>
where
    S: EventStore + Clone,
{
    pub fn new(store: S, bus: Arc<dyn EventBus>) -> Self {
        Self {
            orders: Repository::new(store.clone(), Arc::clone(&bus)),
            renewals: Repository::new(store.clone(), Arc::clone(&bus)),
            dunning: Repository::new(store, bus),
        }
    }

    pub fn orders(&self) -> &Repository<S, OrderFulfillmentSaga> {
        &self.orders
    }

    pub fn dunning_sagas(&self) -> &Repository<S, DunningSaga> {
        &self.dunning
    }
}

impl<S> WorkflowService<S>
where
    S: EventStore,
{
    async fn start<A, F>(&self, repository: &Repository<S, A>, decide: F) -> Result<AggregateId>
    where
        A: Aggregate,
        F: FnOnce(&A) -> Result<Vec<A::Event>>,
    {
        let id = AggregateId::new();
        let correlation_id = CorrelationId::new();
        let context = EventContext::new(SOURCE).with_correlation_id(correlation_id);
        let result = repository
            .execute(id, &context, decide)
            .await
            .map_err(|e: SagaError| e.undelivered(id))?;
        record_transition_metrics(&result.events);
        tracing::info!(
            saga_type = A::aggregate_type(),
            saga_id = %id,
            %correlation_id,
            "saga started"
        );
        Ok(id)
    }

    async fn command<A, F>(
        &self,
        repository: &Repository<S, A>,
        id: AggregateId,
        decide: F,
    ) -> Result<AggregateRoot<A>>
    where
        A: Aggregate,
        F: FnOnce(&A) -> Result<Vec<A::Event>>,
    {
        // Commands on a missing saga fail with NotStarted from the saga itself.
        let result = repository
            .execute(id, &EventContext::new(SOURCE), decide)
            .await
            .map_err(|e: SagaError| e.undelivered(id))?;
        record_transition_metrics(&result.events);
        Ok(result.aggregate)
    }

    /// Starts fulfillment of a new order. Returns the saga id, which is also
    /// the order id.
    #[tracing::instrument(skip(self, details), fields(medication = %details.medication))]
    pub async fn start_order(&self, details: OrderDetails) -> Result<AggregateId> {
        self.start(&self.orders, |s: &OrderFulfillmentSaga| s.start(details))
            .await
    }

    pub async fn order(&self, id: AggregateId) -> Result<AggregateRoot<OrderFulfillmentSaga>> {
        Ok(self.orders.get(id).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn start_renewal(
        &self,
        subscription_id: SubscriptionId,
        patient_id: PatientId,
        amount: Money,
    ) -> Result<AggregateId> {
        self.start(&self.renewals, |s: &SubscriptionRenewalSaga| {
            s.start(subscription_id, patient_id, amount)
        })
        .await
    }

    pub async fn renewal(&self, id: AggregateId) -> Result<AggregateRoot<SubscriptionRenewalSaga>> {
        Ok(self.renewals.get(id).await?)
    }

    pub async fn verify_payment_method(
        &self,
        id: AggregateId,
        payment_method_id: impl Into<String>,
    ) -> Result<AggregateRoot<SubscriptionRenewalSaga>> {
        let payment_method_id = payment_method_id.into();
        self.command(&self.renewals, id, |s| s.verify_payment_method(payment_method_id))
            .await
    }

    pub async fn record_renewal_payment(
        &self,
        id: AggregateId,
        outcome: PaymentOutcome,
        error_code: Option<String>,
    ) -> Result<AggregateRoot<SubscriptionRenewalSaga>> {
        self.command(&self.renewals, id, |s| s.record_payment_attempt(outcome, error_code))
            .await
    }

    pub async fn complete_renewal(
        &self,
        id: AggregateId,
        transaction_id: impl Into<String>,
    ) -> Result<AggregateRoot<SubscriptionRenewalSaga>> {
        let transaction_id = transaction_id.into();
        self.command(&self.renewals, id, |s| s.complete(transaction_id))
            .await
    }

    /// Fails the renewal. A dunning saga for the subscription is started by
    /// the dunning trigger; its id is on the returned saga.
    #[tracing::instrument(skip(self, reason))]
    pub async fn fail_renewal(
        &self,
        id: AggregateId,
        reason: impl Into<String>,
        error_code: Option<String>,
    ) -> Result<AggregateRoot<SubscriptionRenewalSaga>> {
        let reason = reason.into();
        let dunning_saga_id = AggregateId::new();
        self.command(&self.renewals, id, |s| {
            s.fail(reason, error_code, dunning_saga_id)
        })
        .await
    }

    #[tracing::instrument(skip(self, retry_schedule))]
    pub async fn start_dunning(
        &self,
        subscription_id: SubscriptionId,
        retry_schedule: Vec<u32>,
        max_attempts: u32,
    ) -> Result<AggregateId> {
        self.start(&self.dunning, |s: &DunningSaga| {
            s.start(subscription_id, retry_schedule, max_attempts)
        })
        .await
    }

    pub async fn dunning(&self, id: AggregateId) -> Result<AggregateRoot<DunningSaga>> {
        Ok(self.dunning.get(id).await?)
    }

    pub async fn schedule_retry(
        &self,
        id: AggregateId,
        attempt_number: u32,
    ) -> Result<AggregateRoot<DunningSaga>> {
        self.command(&self.dunning, id, |s| s.schedule_retry(attempt_number, Utc::now()))
            .await
    }

    pub async fn record_dunning_payment(
        &self,
        id: AggregateId,
        succeeded: bool,
        error_code: Option<String>,
    ) -> Result<AggregateRoot<DunningSaga>> {
        self.command(&self.dunning, id, |s| s.record_payment_attempt(succeeded, error_code))
            .await
    }

    pub async fn trigger_escalation(
        &self,
        id: AggregateId,
        level: u8,
    ) -> Result<AggregateRoot<DunningSaga>> {
        self.command(&self.dunning, id, |s| s.trigger_escalation(level))
            .await
    }

    pub async fn complete_dunning(
        &self,
        id: AggregateId,
        transaction_id: impl Into<String>,
    ) -> Result<AggregateRoot<DunningSaga>> {
        let transaction_id = transaction_id.into();
        self.command(&self.dunning, id, |s| s.complete(transaction_id))
            .await
    }

    pub async fn fail_dunning(
        &self,
        id: AggregateId,
        reason: impl Into<String>,
    ) -> Result<AggregateRoot<DunningSaga>> {
        let reason = reason.into();
        self.command(&self.dunning, id, |s| s.fail(reason)).await
    }

    /// Stored history of any saga, in order.
    pub async fn history(&self, id: AggregateId) -> Result<Vec<StoredEvent>> {
        Ok(self.orders.history(id).await?)
    }

    /// Publishes a saga's latest event again when something still reacts to
    /// it: the step chain of an order, or the dunning start after a failed
    /// renewal. Resumes a saga whose command returned
    /// [`SagaError::Undelivered`].
    #[tracing::instrument(skip(self))]
    pub async fn redeliver(&self, id: AggregateId) -> Result<Option<StoredEvent>> {
        if let Some(event) = self.orders.republish_latest(id, &STEP_TRIGGERS).await? {
            return Ok(Some(event));
        }
        Ok(self.renewals.republish_latest(id, &[RENEWAL_FAILED]).await?)
    }
}
