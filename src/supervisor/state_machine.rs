use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of one supervised process instance.
///
/// An instance is never reused: once `Exited`, a new instance is built for
/// the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Exited,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ProcessState, ProcessState),
}

#[derive(Debug)]
pub struct StateMachine {
    pub state: ProcessState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: ProcessState::NotStarted }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: ProcessState) -> bool {
        matches!(
            (self.state, to),
            (ProcessState::NotStarted, ProcessState::Running)
                | (ProcessState::NotStarted, ProcessState::Exited)
                | (ProcessState::Running, ProcessState::Stopping)
                | (ProcessState::Running, ProcessState::Exited)
                | (ProcessState::Stopping, ProcessState::Exited)
        )
    }

    pub fn transition(&mut self, to: ProcessState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    pub fn is_exited(&self) -> bool {
        self.state == ProcessState::Exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state, ProcessState::NotStarted);
        assert!(sm.transition(ProcessState::Running).is_ok());
        assert!(sm.transition(ProcessState::Stopping).is_ok());
        assert!(sm.transition(ProcessState::Exited).is_ok());
        assert!(sm.is_exited());
    }

    #[test]
    fn unexpected_exit_from_running() {
        let mut sm = StateMachine::new();
        sm.transition(ProcessState::Running).unwrap();
        assert!(sm.transition(ProcessState::Exited).is_ok());
    }

    #[test]
    fn exited_is_final() {
        let mut sm = StateMachine::new();
        sm.transition(ProcessState::Running).unwrap();
        sm.transition(ProcessState::Exited).unwrap();
        assert_eq!(
            sm.transition(ProcessState::Running),
            Err(TransitionError::InvalidTransition(ProcessState::Exited, ProcessState::Running))
        );
        assert!(sm.transition(ProcessState::Stopping).is_err());
    }

    #[test]
    fn cannot_stop_before_start() {
        let mut sm = StateMachine::new();
        assert!(sm.transition(ProcessState::Stopping).is_err());
    }
}
