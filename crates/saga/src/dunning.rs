//! Dunning management saga: retries a failed subscription payment on a
//! schedule and escalates while it keeps failing.
//!
//! ```text
//! PendingRetry ──► PendingPaymentAttempt ◄──► Escalated
//!      │                  │                     │
//!      │                  ├──► Completed ◄──────┤
//!      └──────────────────┴──► Failed ◄─────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use common::SubscriptionId;
use domain::{Aggregate, DomainEvent};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state_machine::{Saga, SagaState, TRANSITIONED, Transition};

/// The saga type identifier for dunning management.
pub const SAGA_TYPE: &str = "DunningManagementSaga";

pub const DUNNING_STARTED: &str = "DunningStarted";
pub const RETRY_SCHEDULED: &str = "RetryScheduled";
pub const DUNNING_PAYMENT_ATTEMPT_RECORDED: &str = "DunningPaymentAttemptRecorded";
pub const ESCALATION_TRIGGERED: &str = "EscalationTriggered";
pub const DUNNING_COMPLETED: &str = "DunningCompleted";
pub const DUNNING_FAILED: &str = "DunningFailed";

/// Retry delays in days, one per attempt.
pub const DEFAULT_RETRY_SCHEDULE: [u32; 5] = [1, 3, 7, 14, 30];
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Longest delay a retry schedule may contain.
pub const MAX_RETRY_DELAY_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningState {
    PendingRetry,
    PendingPaymentAttempt,
    Escalated,
    Completed,
    Failed,
}

impl SagaState for DunningState {
    fn allowed_transitions(&self) -> &'static [Self] {
        use DunningState::*;
        match self {
            PendingRetry => &[PendingPaymentAttempt, Failed],
            PendingPaymentAttempt => &[Escalated, Completed, Failed],
            Escalated => &[PendingPaymentAttempt, Completed, Failed],
            Completed | Failed => &[],
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DunningState::PendingRetry => "pending_retry",
            DunningState::PendingPaymentAttempt => "pending_payment_attempt",
            DunningState::Escalated => "escalated",
            DunningState::Completed => "completed",
            DunningState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DunningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Notify,
    PauseService,
    CancelSubscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Phone,
}

/// Ordered actions and notification channels for an escalation level.
pub fn escalation_plan(level: u8) -> (Vec<EscalationAction>, Vec<NotificationChannel>) {
    use EscalationAction::*;
    use NotificationChannel::*;
    match level {
        0 | 1 => (vec![Notify], vec![Email]),
        2 => (vec![Notify, PauseService], vec![Email, Sms]),
        _ => (
            vec![Notify, PauseService, CancelSubscription],
            vec![Email, Sms, Phone],
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DunningEvent {
    Started {
        subscription_id: SubscriptionId,
        retry_schedule: Vec<u32>,
        max_attempts: u32,
    },
    Transitioned(Transition<DunningState>),
    RetryScheduled {
        attempt_number: u32,
        delay_days: u32,
        scheduled_for: DateTime<Utc>,
    },
    PaymentAttemptRecorded {
        attempt_number: u32,
        succeeded: bool,
        error_code: Option<String>,
    },
    EscalationTriggered {
        level: u8,
        actions: Vec<EscalationAction>,
        channels: Vec<NotificationChannel>,
    },
    Completed {
        transaction_id: String,
    },
    Failed {
        reason: String,
    },
}

impl DomainEvent for DunningEvent {
    const EVENT_TYPES: &'static [&'static str] = &[
        DUNNING_STARTED,
        TRANSITIONED,
        RETRY_SCHEDULED,
        DUNNING_PAYMENT_ATTEMPT_RECORDED,
        ESCALATION_TRIGGERED,
        DUNNING_COMPLETED,
        DUNNING_FAILED,
    ];

    fn event_type(&self) -> &'static str {
        match self {
            DunningEvent::Started { .. } => DUNNING_STARTED,
            DunningEvent::Transitioned(_) => TRANSITIONED,
            DunningEvent::RetryScheduled { .. } => RETRY_SCHEDULED,
            DunningEvent::PaymentAttemptRecorded { .. } => DUNNING_PAYMENT_ATTEMPT_RECORDED,
            DunningEvent::EscalationTriggered { .. } => ESCALATION_TRIGGERED,
            DunningEvent::Completed { .. } => DUNNING_COMPLETED,
            DunningEvent::Failed { .. } => DUNNING_FAILED,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DunningSaga {
    state: Option<DunningState>,
    subscription_id: Option<SubscriptionId>,
    retry_schedule: Vec<u32>,
    max_attempts: u32,
    attempt_number: u32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error_code: Option<String>,
    escalation_level: u8,
    escalation_actions: Vec<EscalationAction>,
    notification_channels: Vec<NotificationChannel>,
    transaction_id: Option<String>,
    failure_reason: Option<String>,
}

impl DunningSaga {
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription_id
    }

    pub fn retry_schedule(&self) -> &[u32] {
        &self.retry_schedule
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Number of the most recently scheduled retry.
    pub fn attempt_number(&self) -> u32 {
        self.attempt_number
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn last_error_code(&self) -> Option<&str> {
        self.last_error_code.as_deref()
    }

    pub fn escalation_level(&self) -> u8 {
        self.escalation_level
    }

    pub fn escalation_actions(&self) -> &[EscalationAction] {
        &self.escalation_actions
    }

    pub fn notification_channels(&self) -> &[NotificationChannel] {
        &self.notification_channels
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Delay before the given attempt. Attempts past the end of the schedule
    /// reuse its last delay.
    fn delay_for(&self, attempt_number: u32) -> u32 {
        let index = attempt_number.saturating_sub(1) as usize;
        self.retry_schedule
            .get(index)
            .or(self.retry_schedule.last())
            .copied()
            .unwrap_or(0)
    }

    pub fn start(
        &self,
        subscription_id: SubscriptionId,
        retry_schedule: Vec<u32>,
        max_attempts: u32,
    ) -> Result<Vec<DunningEvent>> {
        self.require_not_started()?;
        if retry_schedule.is_empty() {
            return Err(SagaError::InvalidInput("retry schedule cannot be empty".into()));
        }
        if max_attempts == 0 {
            return Err(SagaError::InvalidInput("max attempts must be at least 1".into()));
        }
        if let Some(days) = retry_schedule.iter().find(|d| **d > MAX_RETRY_DELAY_DAYS) {
            return Err(SagaError::InvalidInput(format!(
                "retry delay of {days} days exceeds {MAX_RETRY_DELAY_DAYS}"
            )));
        }
        Ok(vec![DunningEvent::Started {
            subscription_id,
            retry_schedule,
            max_attempts,
        }])
    }

    /// Schedules the next payment retry. `attempt_number` must be the one
    /// after the last scheduled attempt and may not exceed `max_attempts`.
    pub fn schedule_retry(&self, attempt_number: u32, now: DateTime<Utc>) -> Result<Vec<DunningEvent>> {
        self.current_state()?;
        if attempt_number > self.max_attempts {
            return Err(SagaError::RetryLimitExceeded {
                attempt: attempt_number,
                max_attempts: self.max_attempts,
            });
        }
        if attempt_number != self.attempt_number + 1 {
            return Err(SagaError::InvalidInput(format!(
                "expected retry attempt {}, got {attempt_number}",
                self.attempt_number + 1
            )));
        }

        let delay_days = self.delay_for(attempt_number);
        let scheduled_for = now
            .checked_add_signed(Duration::days(i64::from(delay_days)))
            .ok_or_else(|| {
                SagaError::InvalidInput(format!("retry in {delay_days} days is out of range"))
            })?;
        let transition = self.transition_to(DunningState::PendingPaymentAttempt, "schedule_retry")?;
        Ok(vec![
            DunningEvent::Transitioned(transition),
            DunningEvent::RetryScheduled {
                attempt_number,
                delay_days,
                scheduled_for,
            },
        ])
    }

    pub fn record_payment_attempt(
        &self,
        succeeded: bool,
        error_code: Option<String>,
    ) -> Result<Vec<DunningEvent>> {
        self.require_state(&[DunningState::PendingPaymentAttempt], "record_payment_attempt")?;
        Ok(vec![DunningEvent::PaymentAttemptRecorded {
            attempt_number: self.attempt_number,
            succeeded,
            error_code,
        }])
    }

    pub fn trigger_escalation(&self, level: u8) -> Result<Vec<DunningEvent>> {
        self.current_state()?;
        if level <= self.escalation_level {
            return Err(SagaError::EscalationLevelNotIncreasing {
                current: self.escalation_level,
                requested: level,
            });
        }

        let transition = self.transition_to(DunningState::Escalated, "trigger_escalation")?;
        let (actions, channels) = escalation_plan(level);
        Ok(vec![
            DunningEvent::Transitioned(transition),
            DunningEvent::EscalationTriggered {
                level,
                actions,
                channels,
            },
        ])
    }

    pub fn complete(&self, transaction_id: String) -> Result<Vec<DunningEvent>> {
        let transition = self.transition_to(DunningState::Completed, "complete")?;
        Ok(vec![
            DunningEvent::Transitioned(transition),
            DunningEvent::Completed { transaction_id },
        ])
    }

    pub fn fail(&self, reason: impl Into<String>) -> Result<Vec<DunningEvent>> {
        let transition = self.transition_to(DunningState::Failed, "fail")?;
        Ok(vec![
            DunningEvent::Transitioned(transition),
            DunningEvent::Failed {
                reason: reason.into(),
            },
        ])
    }
}

impl Aggregate for DunningSaga {
    type Event = DunningEvent;

    fn aggregate_type() -> &'static str {
        SAGA_TYPE
    }

    fn apply(&mut self, event: &DunningEvent) {
        match event {
            DunningEvent::Started {
                subscription_id,
                retry_schedule,
                max_attempts,
            } => {
                self.subscription_id = Some(*subscription_id);
                self.retry_schedule = retry_schedule.clone();
                self.max_attempts = *max_attempts;
                self.state = Some(DunningState::PendingRetry);
            }
            DunningEvent::Transitioned(transition) => {
                self.state = Some(transition.to);
            }
            DunningEvent::RetryScheduled {
                attempt_number,
                scheduled_for,
                ..
            } => {
                self.attempt_number = *attempt_number;
                self.next_retry_at = Some(*scheduled_for);
            }
            DunningEvent::PaymentAttemptRecorded { error_code, .. } => {
                self.last_error_code = error_code.clone();
            }
            DunningEvent::EscalationTriggered {
                level,
                actions,
                channels,
            } => {
                self.escalation_level = *level;
                self.escalation_actions = actions.clone();
                self.notification_channels = channels.clone();
            }
            DunningEvent::Completed { transaction_id } => {
                self.transaction_id = Some(transaction_id.clone());
                self.next_retry_at = None;
            }
            DunningEvent::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
                self.next_retry_at = None;
            }
        }
    }
}

impl Saga for DunningSaga {
    type State = DunningState;

    fn state(&self) -> Option<DunningState> {
        self.state
    }
}
