//! Container lifecycle states and the power-event transition table.
//!
//! A container's state changes two ways: an operation declares intent
//! (`Starting`, `Stopping`, ...) before driving the infrastructure, and
//! infrastructure events report what actually happened (`Running`,
//! `Stopped`, ...). The table in [`State::evented`] reconciles the two:
//! an event that confirms an in-flight intent leaves the intent state in
//! place so the operation can complete it, while an unsolicited event
//! moves the container directly to the observed state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Unknown,
    Creating,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Removing,
    Removed,
    Fixing,
}

/// A power-lifecycle event observed from the infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerEvent {
    PoweredOn,
    PoweredOff,
    Suspended,
    Removed,
}

impl State {
    /// Returns the state this container should move to on `event`.
    ///
    /// When the current state is already the intent or result of the
    /// event's transition, the current state is kept. In particular a
    /// `PoweredOff` event observed while `Stopping` leaves the container
    /// in `Stopping` so the stop operation itself records completion.
    #[must_use]
    pub fn evented(self, event: PowerEvent) -> State {
        match event {
            PowerEvent::PoweredOn => match self {
                State::Starting | State::Running => self,
                _ => State::Running,
            },
            PowerEvent::PoweredOff => match self {
                State::Stopping | State::Stopped => self,
                _ => State::Stopped,
            },
            PowerEvent::Suspended => match self {
                State::Suspending | State::Suspended => self,
                _ => State::Suspended,
            },
            PowerEvent::Removed => State::Removed,
        }
    }

    /// Checks that a start may be attempted from this state.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidState`] unless the container is
    /// `Created`, `Stopped`, or `Suspended`.
    pub fn check_start(self) -> Result<(), CoreError> {
        match self {
            State::Created | State::Stopped | State::Suspended => Ok(()),
            other => Err(CoreError::InvalidState {
                op: "start",
                state: other,
            }),
        }
    }

    /// Checks that a stop may be attempted from this state.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidState`] unless the container is
    /// `Running`, `Starting`, `Suspending`, or `Suspended`.
    pub fn check_stop(self) -> Result<(), CoreError> {
        match self {
            State::Running | State::Starting | State::Suspending | State::Suspended => Ok(()),
            other => Err(CoreError::InvalidState {
                op: "stop",
                state: other,
            }),
        }
    }

    /// Checks that a remove may be attempted from this state.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidState`] if the container is still
    /// powered on or already being removed.
    pub fn check_remove(self) -> Result<(), CoreError> {
        match self {
            State::Running | State::Starting | State::Removing | State::Removed => {
                Err(CoreError::InvalidState {
                    op: "remove",
                    state: self,
                })
            }
            _ => Ok(()),
        }
    }

    /// Returns `true` for states that reflect a powered-on guest.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, State::Running | State::Starting)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unknown => "Unknown",
            State::Creating => "Creating",
            State::Created => "Created",
            State::Starting => "Starting",
            State::Running => "Running",
            State::Stopping => "Stopping",
            State::Stopped => "Stopped",
            State::Suspending => "Suspending",
            State::Suspended => "Suspended",
            State::Removing => "Removing",
            State::Removed => "Removed",
            State::Fixing => "Fixing",
        };
        f.write_str(s)
    }
}

impl fmt::Display for PowerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerEvent::PoweredOn => "powered on",
            PowerEvent::PoweredOff => "powered off",
            PowerEvent::Suspended => "suspended",
            PowerEvent::Removed => "removed",
        };
        f.write_str(s)
    }
}
