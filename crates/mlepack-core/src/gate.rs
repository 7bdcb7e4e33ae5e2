//! # Session Gate State Machine
//!
//! Single-flight guard for session-mutating operations.
//!
//! | From                | Event     | To         |
//! |---------------------|-----------|------------|
//! | Inactive, Active    | `Pending` | `Pending`  |
//! | Pending             | `Success` | `Active`   |
//! | Pending             | `Failure` | `Inactive` |
//!
//! No other transitions exist. In particular nothing leaves `Pending` except
//! an explicit success or failure report.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one session's gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    #[default]
    Inactive,
    Pending,
    Active,
}

/// Events accepted by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateEvent {
    Pending,
    Success,
    Failure,
}

/// The transition function. `None` when `event` is not accepted in `state`.
#[must_use]
pub const fn transition(state: GateState, event: GateEvent) -> Option<GateState> {
    match (state, event) {
        (GateState::Inactive | GateState::Active, GateEvent::Pending) => Some(GateState::Pending),
        (GateState::Pending, GateEvent::Success) => Some(GateState::Active),
        (GateState::Pending, GateEvent::Failure) => Some(GateState::Inactive),
        _ => None,
    }
}

impl GateState {
    /// Whether a new operation may start.
    #[must_use]
    pub const fn accepts_operation(self) -> bool {
        !matches!(self, GateState::Pending)
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateState::Inactive => "inactive",
            GateState::Pending => "pending",
            GateState::Active => "active",
        };
        f.write_str(name)
    }
}

// =============================================================================
// TESTS
// =============================================================================
