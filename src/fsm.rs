//! Explicit transition-table state machine.
//!
//! Devices in the emulator track their progress through guarded finite state
//! machines. This module provides the engine those machines are built on:
//!
//! - a transition table mapping `(event, source state)` to a single destination
//! - per-event guards that may cancel a transition before it happens
//! - an ordered registry of entry callbacks, run synchronously on every
//!   transition into a state, before [`StateMachine::event`] returns
//!
//! The machine is generic over the state type `S`, the event type `E` and a
//! context `C` that guards and callbacks operate on. The context is passed in on
//! every call rather than captured, so a device can keep its mutable data next to
//! the machine without sharing ownership.
//!
//! # Example
//!
//! ```
//! use rust_bbsim::fsm::{StateMachine, Transition};
//!
//! let mut door = StateMachine::<&str, &str, Vec<String>>::new(
//!     "closed",
//!     vec![
//!         Transition::new("open", &["closed"], "opened"),
//!         Transition::new("close", &["opened"], "closed"),
//!     ],
//! )
//! .on_enter("opened", |log, change| log.push(format!("{} -> {}", change.src, change.dst)));
//!
//! let mut log = Vec::new();
//! assert_eq!(door.event("open", &mut log), Ok("opened"));
//! assert!(door.event("open", &mut log).is_err());
//! assert_eq!(log, vec!["closed -> opened".to_string()]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

/// Bounds shared by state and event labels.
pub trait Label: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static {}

impl<T> Label for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + 'static {}

/// One row of the transition table: `event` moves any state in `src` to `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S, E> {
    /// Event name
    pub event: E,
    /// Permitted source states
    pub src: Vec<S>,
    /// Destination state
    pub dst: S,
}

impl<S: Clone, E> Transition<S, E> {
    /// Create a table row
    pub fn new(event: E, src: &[S], dst: S) -> Self {
        Self {
            event,
            src: src.to_vec(),
            dst,
        }
    }
}

/// A transition that has been accepted and applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change<S, E> {
    /// Event that triggered the change
    pub event: E,
    /// State before the transition
    pub src: S,
    /// State after the transition
    pub dst: S,
}

/// Why a requested transition did not happen.
///
/// None of these leave the machine in a different state than before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError<S: Label, E: Label> {
    /// The current state is not in the event's permitted source list.
    #[error("event {event} inappropriate in current state {current}")]
    Rejected {
        /// Requested event
        event: E,
        /// State the machine stayed in
        current: S,
    },

    /// A guard refused the transition.
    #[error("event {event} cancelled: {reason}")]
    Cancelled {
        /// Requested event
        event: E,
        /// Reason reported by the guard
        reason: String,
    },

    /// The event does not appear in the transition table.
    #[error("event {event} does not exist")]
    Unknown {
        /// Requested event
        event: E,
    },
}

type Guard<C> = Box<dyn Fn(&C) -> Result<(), String> + Send + Sync>;
type EntryCallback<S, E, C> = Box<dyn Fn(&mut C, &Change<S, E>) + Send + Sync>;

/// Guarded finite state machine with ordered entry callbacks.
pub struct StateMachine<S: Label, E: Label, C> {
    current: S,
    table: HashMap<(E, S), S>,
    events: Vec<E>,
    guards: Vec<(E, Guard<C>)>,
    on_enter: Vec<(Option<S>, EntryCallback<S, E, C>)>,
}

impl<S: Label, E: Label, C> StateMachine<S, E, C> {
    /// Create a machine in `initial` from an explicit transition table.
    pub fn new(initial: S, transitions: Vec<Transition<S, E>>) -> Self {
        let mut table = HashMap::new();
        let mut events = Vec::new();
        for transition in transitions {
            if !events.contains(&transition.event) {
                events.push(transition.event);
            }
            for src in transition.src {
                table.insert((transition.event, src), transition.dst);
            }
        }

        Self {
            current: initial,
            table,
            events,
            guards: Vec::new(),
            on_enter: Vec::new(),
        }
    }

    /// Register a guard run before `event` is applied.
    ///
    /// Returning `Err(reason)` cancels the transition.
    pub fn with_guard<F>(mut self, event: E, guard: F) -> Self
    where
        F: Fn(&C) -> Result<(), String> + Send + Sync + 'static,
    {
        self.guards.push((event, Box::new(guard)));
        self
    }

    /// Register a callback run on every transition into `state`.
    pub fn on_enter<F>(mut self, state: S, callback: F) -> Self
    where
        F: Fn(&mut C, &Change<S, E>) + Send + Sync + 'static,
    {
        self.on_enter.push((Some(state), Box::new(callback)));
        self
    }

    /// Register a callback run on every transition, whatever the destination.
    pub fn on_enter_any<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut C, &Change<S, E>) + Send + Sync + 'static,
    {
        self.on_enter.push((None, Box::new(callback)));
        self
    }

    /// Current state
    pub fn current(&self) -> S {
        self.current
    }

    /// Whether the machine is currently in `state`
    pub fn is(&self, state: S) -> bool {
        self.current == state
    }

    /// Whether `event` is permitted from the current state (guards not evaluated)
    pub fn can(&self, event: E) -> bool {
        self.table.contains_key(&(event, self.current))
    }

    /// Events permitted from the current state, in table order
    pub fn available_events(&self) -> Vec<E> {
        self.events
            .iter()
            .copied()
            .filter(|event| self.can(*event))
            .collect()
    }

    /// Apply `event`.
    ///
    /// On success the state has changed and every matching entry callback has
    /// run, in registration order, before this returns the new state.
    pub fn event(&mut self, event: E, ctx: &mut C) -> Result<S, TransitionError<S, E>> {
        if !self.events.contains(&event) {
            return Err(TransitionError::Unknown { event });
        }

        let dst = *self
            .table
            .get(&(event, self.current))
            .ok_or(TransitionError::Rejected {
                event,
                current: self.current,
            })?;

        for (_, guard) in self.guards.iter().filter(|(e, _)| *e == event) {
            guard(ctx).map_err(|reason| TransitionError::Cancelled { event, reason })?;
        }

        let change = Change {
            event,
            src: self.current,
            dst,
        };
        self.current = dst;

        for (state, callback) in &self.on_enter {
            if state.map_or(true, |s| s == dst) {
                callback(ctx, &change);
            }
        }

        Ok(dst)
    }
}

impl<S: Label, E: Label, C> fmt::Debug for StateMachine<S, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("transitions", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turnstile() -> StateMachine<&'static str, &'static str, Vec<&'static str>> {
        StateMachine::new(
            "locked",
            vec![
                Transition::new("coin", &["locked"], "unlocked"),
                Transition::new("push", &["unlocked"], "locked"),
                Transition::new("break", &["locked", "unlocked"], "broken"),
            ],
        )
    }

    #[test]
    fn test_valid_transition_changes_state() {
        let mut sm = turnstile();
        let mut log = Vec::new();
        assert_eq!(sm.event("coin", &mut log), Ok("unlocked"));
        assert!(sm.is("unlocked"));
        assert_eq!(sm.event("push", &mut log), Ok("locked"));
    }

    #[test]
    fn test_rejected_transition_keeps_state() {
        let mut sm = turnstile();
        let mut log = Vec::new();
        assert_eq!(
            sm.event("push", &mut log),
            Err(TransitionError::Rejected {
                event: "push",
                current: "locked"
            })
        );
        assert_eq!(sm.current(), "locked");
    }

    #[test]
    fn test_unknown_event() {
        let mut sm = turnstile();
        let mut log = Vec::new();
        assert_eq!(
            sm.event("kick", &mut log),
            Err(TransitionError::Unknown { event: "kick" })
        );
    }

    #[test]
    fn test_guard_cancels_without_callbacks() {
        let mut sm = turnstile()
            .with_guard("coin", |log: &Vec<&str>| {
                if log.contains(&"jammed") {
                    Err("coin slot jammed".to_string())
                } else {
                    Ok(())
                }
            })
            .on_enter("unlocked", |log, _| log.push("entered"));

        let mut log = vec!["jammed"];
        let err = sm.event("coin", &mut log).unwrap_err();
        assert!(matches!(err, TransitionError::Cancelled { .. }));
        assert_eq!(sm.current(), "locked");
        assert_eq!(log, vec!["jammed"]);
    }

    #[test]
    fn test_entry_callbacks_run_in_registration_order() {
        let mut sm = turnstile()
            .on_enter_any(|log, _| log.push("any"))
            .on_enter("unlocked", |log, _| log.push("unlocked"))
            .on_enter("locked", |log, _| log.push("locked"));

        let mut log = Vec::new();
        sm.event("coin", &mut log).unwrap();
        assert_eq!(log, vec!["any", "unlocked"]);
    }

    #[test]
    fn test_callback_sees_change() {
        let mut sm = turnstile().on_enter_any(|log, change| {
            log.push(change.src);
            log.push(change.event);
            log.push(change.dst);
        });
        let mut log = Vec::new();
        sm.event("break", &mut log).unwrap();
        assert_eq!(log, vec!["locked", "break", "broken"]);
    }

    #[test]
    fn test_available_events() {
        let sm = turnstile();
        assert_eq!(sm.available_events(), vec!["coin", "break"]);
        assert!(sm.can("coin"));
        assert!(!sm.can("push"));
    }
}
