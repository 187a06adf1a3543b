//! Subscription renewal saga.
//!
//! ```text
//! PendingPaymentMethodCheck ──► PendingPaymentAttempt ──► Completed
//!            │                           │
//!            └───────────────────────────┴──► Failed
//! ```

use common::{AggregateId, Money, PatientId, SubscriptionId};
use domain::{Aggregate, DomainEvent};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state_machine::{Saga, SagaState, TRANSITIONED, Transition};

/// The saga type identifier for subscription renewal.
pub const SAGA_TYPE: &str = "SubscriptionRenewalSaga";

pub const RENEWAL_STARTED: &str = "SubscriptionRenewalStarted";
pub const PAYMENT_METHOD_VERIFIED: &str = "PaymentMethodVerified";
pub const PAYMENT_ATTEMPT_RECORDED: &str = "PaymentAttemptRecorded";
pub const RENEWAL_COMPLETED: &str = "SubscriptionRenewalCompleted";
pub const RENEWAL_FAILED: &str = "SubscriptionRenewalFailed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalState {
    PendingPaymentMethodCheck,
    PendingPaymentAttempt,
    Completed,
    Failed,
}

impl SagaState for RenewalState {
    fn allowed_transitions(&self) -> &'static [Self] {
        use RenewalState::*;
        match self {
            PendingPaymentMethodCheck => &[PendingPaymentAttempt, Failed],
            PendingPaymentAttempt => &[Completed, Failed],
            Completed | Failed => &[],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RenewalState::PendingPaymentMethodCheck => "pending_payment_method_check",
            RenewalState::PendingPaymentAttempt => "pending_payment_attempt",
            RenewalState::Completed => "completed",
            RenewalState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RenewalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RenewalEvent {
    Started {
        subscription_id: SubscriptionId,
        patient_id: PatientId,
        amount: Money,
    },
    Transitioned(Transition<RenewalState>),
    PaymentMethodVerified {
        payment_method_id: String,
    },
    PaymentAttemptRecorded {
        attempt_number: u32,
        outcome: PaymentOutcome,
        error_code: Option<String>,
    },
    Completed {
        transaction_id: String,
    },
    Failed {
        subscription_id: SubscriptionId,
        reason: String,
        error_code: Option<String>,
        /// Id reserved for the dunning saga that follows this failure.
        dunning_saga_id: AggregateId,
    },
}

impl DomainEvent for RenewalEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        RENEWAL_STARTED,
        TRANSITIONED,
        PAYMENT_METHOD_VERIFIED,
        PAYMENT_ATTEMPT_RECORDED,
        RENEWAL_COMPLETED,
        RENEWAL_FAILED,
    ];

    fn event_type(&self) -> &'static str {
        match self {
            RenewalEvent::Started { .. } => RENEWAL_STARTED,
            RenewalEvent::Transitioned(_) => TRANSITIONED,
            RenewalEvent::PaymentMethodVerified { .. } => PAYMENT_METHOD_VERIFIED,
            RenewalEvent::PaymentAttemptRecorded { .. } => PAYMENT_ATTEMPT_RECORDED,
            RenewalEvent::Completed { .. } => RENEWAL_COMPLETED,
            RenewalEvent::Failed { .. } => RENEWAL_FAILED,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionRenewalSaga {
    state: Option<RenewalState>,
    subscription_id: Option<SubscriptionId>,
    patient_id: Option<PatientId>,
    amount: Money,
    payment_method_id: Option<String>,
    attempt_number: u32,
    last_outcome: Option<PaymentOutcome>,
    last_error_code: Option<String>,
    transaction_id: Option<String>,
    failure_reason: Option<String>,
    dunning_saga_id: Option<AggregateId>,
}

impl SubscriptionRenewalSaga {
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription_id
    }

    pub fn patient_id(&self) -> Option<PatientId> {
        self.patient_id
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn payment_method_id(&self) -> Option<&str> {
        self.payment_method_id.as_deref()
    }

    /// Number of payment attempts recorded so far.
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn last_outcome(&self) -> Option<PaymentOutcome> {
        self.last_outcome
    }

    pub fn last_error_code(&self) -> Option<&str> {
        self.last_error_code.as_deref()
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Dunning saga started for this renewal after it failed.
    pub fn dunning_saga_id(&self) -> Option<AggregateId> {
        self.dunning_saga_id
    }

    pub fn start(
        &self,
        subscription_id: SubscriptionId,
        patient_id: PatientId,
        amount: Money,
    ) -> Result<Vec<RenewalEvent>> {
        self.require_not_started()?;
        if !amount.is_positive() {
            return Err(SagaError::InvalidInput(format!(
                "renewal amount must be positive, got {amount}"
            )));
        }
        Ok(vec![RenewalEvent::Started {
            subscription_id,
            patient_id,
            amount,
        }])
    }

    pub fn verify_payment_method(&self, payment_method_id: String) -> Result<Vec<RenewalEvent>> {
        if payment_method_id.trim().is_empty() {
            return Err(SagaError::InvalidInput("payment method id is required".into()));
        }
        let transition = self.transition_to(RenewalState::PendingPaymentAttempt, "payment_method_verified")?;
        Ok(vec![
            RenewalEvent::Transitioned(transition),
            RenewalEvent::PaymentMethodVerified { payment_method_id },
        ])
    }

    /// Records the outcome of one charge. The state does not change; the
    /// caller completes or fails the renewal afterwards.
    pub fn record_payment_attempt(
        &self,
        outcome: PaymentOutcome,
        error_code: Option<String>,
    ) -> Result<Vec<RenewalEvent>> {
        self.require_state(&[RenewalState::PendingPaymentAttempt], "record_payment_attempt")?;
        Ok(vec![RenewalEvent::PaymentAttemptRecorded {
            attempt_number: self.attempt_number + 1,
            outcome,
            error_code,
        }])
    }

    pub fn complete(&self, transaction_id: String) -> Result<Vec<RenewalEvent>> {
        let transition = self.transition_to(RenewalState::Completed, "complete")?;
        Ok(vec![
            RenewalEvent::Transitioned(transition),
            RenewalEvent::Completed { transaction_id },
        ])
    }

    pub fn fail(
        &self,
        reason: impl Into<String>,
        error_code: Option<String>,
        dunning_saga_id: AggregateId,
    ) -> Result<Vec<RenewalEvent>> {
        let subscription_id = self.subscription_id.ok_or(SagaError::NotStarted {
            saga_type: SAGA_TYPE,
        })?;
        let transition = self.transition_to(RenewalState::Failed, "fail")?;
        Ok(vec![
            RenewalEvent::Transitioned(transition),
            RenewalEvent::Failed {
                subscription_id,
                reason: reason.into(),
                error_code,
                dunning_saga_id,
            },
        ])
    }
}

impl Aggregate for SubscriptionRenewalSaga {
    type Event = RenewalEvent;

    fn aggregate_type() -> &'static str {
        SAGA_TYPE
    }

    fn apply(&mut self, event: &RenewalEvent) {
        match event {
            RenewalEvent::Started {
                subscription_id,
                patient_id,
                amount,
            } => {
                self.subscription_id = Some(*subscription_id);
                self.patient_id = Some(*patient_id);
                self.amount = *amount;
                self.state = Some(RenewalState::PendingPaymentMethodCheck);
            }
            RenewalEvent::Transitioned(transition) => {
                self.state = Some(transition.to);
            }
            RenewalEvent::PaymentMethodVerified { payment_method_id } => {
                self.payment_method_id = Some(payment_method_id.clone());
            }
            RenewalEvent::PaymentAttemptRecorded {
                attempt_number,
                outcome,
                error_code,
            } => {
                self.attempt_number = *attempt_number;
                self.last_outcome = Some(*outcome);
                self.last_error_code = error_code.clone();
            }
            RenewalEvent::Completed { transaction_id } => {
                self.transaction_id = Some(transaction_id.clone());
            }
            RenewalEvent::Failed {
                reason,
                error_code,
                dunning_saga_id,
                ..
            } => {
                self.failure_reason = Some(reason.clone());
                self.dunning_saga_id = Some(*dunning_saga_id);
                if error_code.is_some() {
                    self.last_error_code = error_code.clone();
                }
            }
        }
    }
}

impl Saga for SubscriptionRenewalSaga {
    type State = RenewalState;

    fn state(&self) -> Option<RenewalState> {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::AggregateRoot;
    use RenewalState::*;

    fn started(amount: Money) -> AggregateRoot<SubscriptionRenewalSaga> {
        let mut saga = AggregateRoot::new(AggregateId::new());
        saga.execute(|s: &SubscriptionRenewalSaga| {
            s.start(SubscriptionId::new(), PatientId::new(), amount)
        })
        .unwrap();
        saga
    }

    #[test]
    fn renewal_happy_path() {
        let mut saga = started(Money::from_cents(9999));
        assert_eq!(saga.state().state(), Some(PendingPaymentMethodCheck));
        assert_eq!(saga.state().amount().to_string(), "$99.99");

        saga.execute(|s| s.verify_payment_method("pm_card".into())).unwrap();
        assert_eq!(saga.state().state(), Some(PendingPaymentAttempt));

        saga.execute(|s| s.record_payment_attempt(PaymentOutcome::Succeeded, None))
            .unwrap();
        saga.execute(|s| s.complete("txn_1".into())).unwrap();

        let state = saga.state();
        assert_eq!(state.state(), Some(Completed));
        assert_eq!(state.attempt_number(), 1);
        assert_eq!(state.transaction_id(), Some("txn_1"));
    }

    #[test]
    fn completing_before_payment_method_check_is_invalid() {
        let saga = started(Money::from_cents(9999));
        let err = saga.state().complete("txn_1".into()).unwrap_err();

        match err {
            SagaError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "pending_payment_method_check");
                assert_eq!(to, "completed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn payment_method_check_can_fail_directly() {
        let mut saga = started(Money::from_cents(500));
        saga.execute(|s| s.fail("card expired", Some("expired_card".into()), AggregateId::new()))
            .unwrap();

        let state = saga.state();
        assert_eq!(state.state(), Some(Failed));
        assert_eq!(state.failure_reason(), Some("card expired"));
        assert_eq!(state.last_error_code(), Some("expired_card"));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut saga = started(Money::from_cents(500));
        saga.execute(|s| s.fail("no card", None, AggregateId::new())).unwrap();

        assert!(matches!(
            saga.state().verify_payment_method("pm".into()),
            Err(SagaError::InvalidTransition { .. })
        ));
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn start_requires_positive_amount() {
        let saga = SubscriptionRenewalSaga::default();
        let result = saga.start(SubscriptionId::new(), PatientId::new(), Money::zero());
        assert!(matches!(result, Err(SagaError::InvalidInput(_))));
    }

    #[test]
    fn operations_before_start_fail() {
        let saga = SubscriptionRenewalSaga::default();
        assert!(matches!(
            saga.complete("txn".into()),
            Err(SagaError::NotStarted { .. })
        ));
    }

    #[test]
    fn payment_attempts_count_up_and_replay_is_idempotent() {
        let mut saga = started(Money::from_cents(9999));
        saga.execute(|s| s.verify_payment_method("pm".into())).unwrap();
        saga.execute(|s| s.record_payment_attempt(PaymentOutcome::Declined, Some("insufficient_funds".into())))
            .unwrap();
        saga.execute(|s| s.record_payment_attempt(PaymentOutcome::Succeeded, None))
            .unwrap();
        assert_eq!(saga.state().attempt_number(), 2);
        assert_eq!(saga.state().last_outcome(), Some(PaymentOutcome::Succeeded));

        let events = saga.pending_events().to_vec();
        let mut state = AggregateRoot::<SubscriptionRenewalSaga>::from_events(saga.id(), &events)
            .state()
            .clone();
        assert_eq!(&state, saga.state());

        state.apply(events.last().unwrap());
        assert_eq!(state.attempt_number(), 2);
    }
}
