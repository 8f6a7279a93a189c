//! Edge-triggered presence tracking.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Absent,
    Present,
}

impl From<bool> for Presence {
    fn from(detected: bool) -> Self {
        if detected {
            Presence::Present
        } else {
            Presence::Absent
        }
    }
}

/// An edge between two consecutive evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Arrived,
    Departed,
}

impl Transition {
    /// State after the edge.
    pub fn resulting(self) -> Presence {
        match self {
            Transition::Arrived => Presence::Present,
            Transition::Departed => Presence::Absent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceState {
    pub detected: bool,
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Tracks presence and emits a [`Transition`] only when the detector result
/// differs from the stored state. Noise tolerance is the detector's job.
#[derive(Debug, Clone)]
pub struct PresenceStateMachine {
    state: PresenceState,
}

impl Default for PresenceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceStateMachine {
    pub fn new() -> Self {
        Self {
            state: PresenceState {
                detected: false,
                last_transition_time: None,
            },
        }
    }

    pub fn current(&self) -> Presence {
        Presence::from(self.state.detected)
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    pub fn observe(&mut self, detected: bool) -> Option<Transition> {
        self.observe_at(detected, Utc::now())
    }

    pub fn observe_at(&mut self, detected: bool, now: DateTime<Utc>) -> Option<Transition> {
        if detected == self.state.detected {
            return None;
        }
        self.state.detected = detected;
        self.state.last_transition_time = Some(now);
        Some(if detected {
            Transition::Arrived
        } else {
            Transition::Departed
        })
    }

    /// Back to `Absent` without emitting anything; used when a session ends.
    pub fn reset(&mut self) {
        self.state = PresenceState {
            detected: false,
            last_transition_time: None,
        };
    }
}
