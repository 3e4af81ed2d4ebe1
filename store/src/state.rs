//! Replica role arbitration.
//!
//! A single mutex-guarded state value processes lifecycle events and gates
//! transaction admission. Transition callbacks run under the state lock so
//! that follow-up processing happens before the next event.

use std::sync::Mutex;

use crate::error::{CResult, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicatedStoreState {
    Created,
    Opened,
    PrimaryPassive,
    PrimaryActive,
    PrimaryChangePending,
    PrimaryClosePending,
    SecondaryPassive,
    SecondaryActive,
    SecondaryChangePending,
    SecondaryClosePending,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicatedStoreEvent {
    Open,
    ChangePrimary,
    ChangeSecondary,
    StartTransaction,
    FinishTransaction,
    SecondaryPumpClosed,
    Close,
}

struct Inner {
    state: ReplicatedStoreState,
    transaction_count: i64,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            inner: Mutex::new(Inner {
                state: ReplicatedStoreState::Created,
                transaction_count: 0,
            }),
        }
    }

    pub fn current_state(&self) -> ReplicatedStoreState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.current_state() == ReplicatedStoreState::Closed
    }

    pub fn transaction_count(&self) -> i64 {
        self.lock().transaction_count
    }

    /// Forces the machine into `Closed` without draining.
    pub fn abort(&self) {
        let mut inner = self.lock();
        log::debug!("state machine aborting from {:?}", inner.state);
        inner.state = ReplicatedStoreState::Closed;
    }

    /// Processes an event; the callback observes the result and the state
    /// reached, while still holding the state lock.
    pub fn process_event<F>(&self, event: ReplicatedStoreEvent, callback: F)
    where
        F: FnOnce(CResult<()>, ReplicatedStoreState),
    {
        let mut inner = self.lock();

        let result = match event {
            ReplicatedStoreEvent::Open => Self::process_open(&mut inner),
            ReplicatedStoreEvent::ChangePrimary => Self::process_change_primary(&mut inner),
            ReplicatedStoreEvent::ChangeSecondary => Self::process_change_secondary(&mut inner),
            ReplicatedStoreEvent::StartTransaction => Self::process_start_transaction(&mut inner),
            ReplicatedStoreEvent::FinishTransaction => Self::process_finish_transaction(&mut inner),
            ReplicatedStoreEvent::SecondaryPumpClosed => {
                Self::process_secondary_pump_closed(&mut inner)
            }
            ReplicatedStoreEvent::Close => Self::process_close(&mut inner),
        };

        callback(result, inner.state);
    }

    /// Convenience for events where only the error matters.
    pub fn process_event_simple(&self, event: ReplicatedStoreEvent) -> CResult<ReplicatedStoreState> {
        let mut result = Err(Error::Internal("event not processed".to_string()));
        let mut state = ReplicatedStoreState::Created;
        self.process_event(event, |r, s| {
            result = r;
            state = s;
        });
        result.map(|_| state)
    }

    fn process_open(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            Created => {
                Self::change_state(inner, Opened);
                Ok(())
            }
            Closed => Err(Error::ObjectClosed),
            other => Err(invalid_transition(ReplicatedStoreEvent::Open, other)),
        }
    }

    fn process_change_primary(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            Opened | SecondaryPassive => {
                Self::change_state(inner, PrimaryPassive);
                Ok(())
            }
            SecondaryActive => {
                Self::change_state(inner, SecondaryChangePending);
                Ok(())
            }
            Closed => Err(Error::ObjectClosed),
            // Re-invoking ChangePrimary while already primary is a no-op.
            PrimaryPassive => Ok(()),
            other => Err(invalid_transition(ReplicatedStoreEvent::ChangePrimary, other)),
        }
    }

    fn process_change_secondary(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            Opened | PrimaryPassive | SecondaryPassive => {
                Self::change_state(inner, SecondaryActive);
                Ok(())
            }
            // Idle -> Active is a no-op here; the pump is already running.
            SecondaryActive => Ok(()),
            PrimaryActive => {
                Self::change_state(inner, PrimaryChangePending);
                Ok(())
            }
            Closed => Err(Error::ObjectClosed),
            other => Err(invalid_transition(ReplicatedStoreEvent::ChangeSecondary, other)),
        }
    }

    fn process_start_transaction(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            PrimaryPassive | PrimaryActive => {
                if inner.state == PrimaryPassive {
                    Self::change_state(inner, PrimaryActive);
                }
                inner.transaction_count += 1;
                Ok(())
            }
            Created | Opened | PrimaryClosePending | SecondaryPassive | SecondaryActive
            | SecondaryClosePending => Err(Error::NotPrimary),
            PrimaryChangePending | SecondaryChangePending => Err(Error::ReconfigurationPending),
            Closed => Err(Error::ObjectClosed),
        }
    }

    fn process_finish_transaction(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            PrimaryActive => {
                if Self::decrement_transaction_count(inner)? == 0 {
                    Self::change_state(inner, PrimaryPassive);
                }
                Ok(())
            }
            PrimaryChangePending => {
                if Self::decrement_transaction_count(inner)? == 0 {
                    Self::change_state(inner, SecondaryActive);
                }
                Ok(())
            }
            PrimaryClosePending => {
                if Self::decrement_transaction_count(inner)? == 0 {
                    Self::change_state(inner, Closed);
                }
                Ok(())
            }
            other => Err(invalid_transition(ReplicatedStoreEvent::FinishTransaction, other)),
        }
    }

    fn process_secondary_pump_closed(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            SecondaryActive => {
                Self::change_state(inner, SecondaryPassive);
                Ok(())
            }
            SecondaryChangePending => {
                Self::change_state(inner, PrimaryPassive);
                Ok(())
            }
            SecondaryClosePending => {
                Self::change_state(inner, Closed);
                Ok(())
            }
            Closed => Ok(()),
            other => Err(invalid_transition(ReplicatedStoreEvent::SecondaryPumpClosed, other)),
        }
    }

    fn process_close(inner: &mut Inner) -> CResult<()> {
        use ReplicatedStoreState::*;
        match inner.state {
            Opened | PrimaryPassive | SecondaryPassive | Created => {
                Self::change_state(inner, Closed);
                Ok(())
            }
            PrimaryActive | PrimaryChangePending => {
                Self::change_state(inner, PrimaryClosePending);
                Ok(())
            }
            SecondaryActive | SecondaryChangePending => {
                Self::change_state(inner, SecondaryClosePending);
                Ok(())
            }
            // Close is idempotent.
            PrimaryClosePending | SecondaryClosePending | Closed => Ok(()),
        }
    }

    fn change_state(inner: &mut Inner, new_state: ReplicatedStoreState) {
        log::debug!("state change {:?} -> {:?}", inner.state, new_state);
        inner.state = new_state;
    }

    fn decrement_transaction_count(inner: &mut Inner) -> CResult<i64> {
        inner.transaction_count -= 1;
        if inner.transaction_count < 0 {
            return Err(Error::Internal(format!(
                "mismatched transaction decrement: count = {}",
                inner.transaction_count
            )));
        }
        Ok(inner.transaction_count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_transition(event: ReplicatedStoreEvent, state: ReplicatedStoreState) -> Error {
    Error::InvalidState(format!("event {:?} not valid in state {:?}", event, state))
}
