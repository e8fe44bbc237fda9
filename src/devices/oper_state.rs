//! Operational state as requested by the controller.
//!
//! A two-state machine independent of the lifecycle machine. It only moves on
//! activate/deactivate commands and is reported as the `admin_state` of ONU
//! indications.

use crate::fsm::{StateMachine, Transition};
use std::fmt;
use tracing::debug;

/// Operational state of a device or port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperState {
    /// Administratively down
    Down,
    /// Administratively up
    Up,
}

impl OperState {
    /// Wire representation used in indications
    pub fn as_str(&self) -> &'static str {
        match self {
            OperState::Down => "down",
            OperState::Up => "up",
        }
    }
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events of the operational state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperEvent {
    /// Bring the device up
    Enable,
    /// Take the device down
    Disable,
}

impl fmt::Display for OperEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperEvent::Enable => "enable",
            OperEvent::Disable => "disable",
        })
    }
}

/// Operational state machine; it needs no context beyond the logging span.
pub type OperStateMachine = StateMachine<OperState, OperEvent, ()>;

/// Build a machine starting in [`OperState::Down`].
pub fn new_oper_state_machine() -> OperStateMachine {
    StateMachine::new(
        OperState::Down,
        vec![
            Transition::new(OperEvent::Enable, &[OperState::Down], OperState::Up),
            Transition::new(OperEvent::Disable, &[OperState::Up], OperState::Down),
        ],
    )
    .on_enter_any(|_, change| {
        debug!("Changing ONU OperState from {} to {}", change.src, change.dst);
    })
}
