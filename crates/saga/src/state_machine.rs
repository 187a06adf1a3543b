//! Transition-table state machine shared by every saga.

use std::fmt::Debug;

use domain::Aggregate;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Result, SagaError};

/// Event type of the transition record every saga emits.
pub const TRANSITIONED: &str = "SagaTransitioned";

/// A saga's state enumeration together with its transition table.
pub trait SagaState:
    Copy + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// States reachable from this one. Terminal states return an empty slice.
    fn allowed_transitions(&self) -> &'static [Self];

    fn as_str(&self) -> &'static str;

    fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    fn can_transition_to(&self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

/// A validated edge of the transition table, recorded as an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
    /// Business operation that caused the move.
    pub trigger: String,
}

/// An aggregate driven by a fixed transition table.
///
/// Every state change goes through [`Saga::transition_to`], which only
/// returns a [`Transition`] for an allowed edge. Sagas record the transition
/// as an event and fold it in `apply`.
pub trait Saga: Aggregate {
    type State: SagaState;

    /// Current state, or `None` before the saga was started.
    fn state(&self) -> Option<Self::State>;

    /// Validates a move to `to`.
    fn transition_to(&self, to: Self::State, trigger: &str) -> Result<Transition<Self::State>> {
        let from = self.current_state()?;
        if !from.can_transition_to(to) {
            tracing::warn!(
                saga_type = Self::aggregate_type(),
                from = from.as_str(),
                to = to.as_str(),
                trigger,
                "rejected saga transition"
            );
            return Err(SagaError::InvalidTransition {
                saga_type: Self::aggregate_type(),
                from: from.as_str(),
                to: to.as_str(),
                trigger: trigger.to_string(),
            });
        }
        Ok(Transition {
            from,
            to,
            trigger: trigger.to_string(),
        })
    }

    fn current_state(&self) -> Result<Self::State> {
        self.state().ok_or(SagaError::NotStarted {
            saga_type: Self::aggregate_type(),
        })
    }

    /// Fails unless the saga is in one of `expected`.
    fn require_state(&self, expected: &[Self::State], operation: &'static str) -> Result<Self::State> {
        let state = self.current_state()?;
        if expected.contains(&state) {
            Ok(state)
        } else {
            Err(SagaError::UnexpectedState {
                saga_type: Self::aggregate_type(),
                state: state.as_str(),
                operation,
            })
        }
    }

    fn require_not_started(&self) -> Result<()> {
        match self.state() {
            None => Ok(()),
            Some(_) => Err(SagaError::AlreadyStarted {
                saga_type: Self::aggregate_type(),
            }),
        }
    }

    fn is_finished(&self) -> bool {
        self.state().is_some_and(|s| s.is_terminal())
    }
}

/// Counts the transitions among freshly stored events.
pub(crate) fn record_transition_metrics(events: &[event_store::StoredEvent]) {
    for event in events.iter().filter(|e| e.event_type() == TRANSITIONED) {
        metrics::counter!("saga_transitions_total", "saga_type" => event.aggregate_type().to_string())
            .increment(1);
    }
}
