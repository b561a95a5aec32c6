//! Circuit state and state-change events.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: tripped, calls fail fast until the blocked-until instant
//! - **`HalfOpen`**: a probe call is permitted to test recovery
//! - **Isolated**: operator-forced open, no automatic recovery
//!
//! # State Transitions
//!
//! ```text
//! Closed ──[trip predicate fires]──────────> Open
//!   ▲                                         │
//!   │                                         │ [blocked-until elapses]
//!   │                                         ▼
//!   └──[probe succeeds]──────────────── HalfOpen
//!            [probe fails] ───────────────> Open
//!
//! isolate(): any ──> Isolated        reset(): any ──> Closed
//! ```
//!
//! The wire labels written to the store are exactly `"Closed"`, `"Open"`,
//! `"HalfOpen"` and `"Isolated"`; peers of the same deployment must agree on
//! them bit for bit.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// State of a circuit, shared by every peer using the same circuit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Calls pass through and are counted.
    Closed,
    /// Tripped. Calls fail fast until the blocked-until instant elapses.
    Open,
    /// Recovery test. A probe call is permitted; its outcome decides the
    /// next transition.
    HalfOpen,
    /// Operator-forced open. Calls fail fast until `reset` is invoked.
    Isolated,
}

impl CircuitState {
    /// The exact label stored by peers of the same deployment.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Open => "Open",
            Self::HalfOpen => "HalfOpen",
            Self::Isolated => "Isolated",
        }
    }

    /// Whether the engine may invoke the guarded call in this state.
    ///
    /// `HalfOpen` allows calls in the probe sense: whatever reaches the
    /// dispatch point while half-open runs as a probe.
    #[must_use]
    pub const fn allows_calls(self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state label that no peer of this deployment emits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown circuit state label: {0:?}")]
pub struct ParseStateError(String);

impl FromStr for CircuitState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Closed" => Ok(Self::Closed),
            "Open" => Ok(Self::Open),
            "HalfOpen" => Ok(Self::HalfOpen),
            "Isolated" => Ok(Self::Isolated),
            other => Err(ParseStateError(other.to_owned())),
        }
    }
}

/// Record describing one successful state transition.
///
/// Passed by reference to the state-change callbacks registered on the
/// engine. Emitted exactly once per transition that took effect, inside the
/// lease scope, so ordering relative to the transition is total.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// Circuit the transition applies to.
    pub circuit_id: String,
    /// State the circuit held before the transition.
    pub prior: CircuitState,
    /// State the circuit holds after the transition.
    pub next: CircuitState,
    /// When the transition was applied.
    pub at: DateTime<Utc>,
    /// Rendering of the guarded-call error that triggered the transition,
    /// when one did (trips and failed probes carry it; recoveries do not).
    pub trigger: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_labels_are_exact() {
        assert_eq!(CircuitState::Closed.as_str(), "Closed");
        assert_eq!(CircuitState::Open.as_str(), "Open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "HalfOpen");
        assert_eq!(CircuitState::Isolated.as_str(), "Isolated");
    }

    #[test]
    fn test_display_matches_wire_label() {
        for state in [
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Isolated,
        ] {
            assert_eq!(state.to_string(), state.as_str());
        }
    }

    #[test]
    fn test_label_round_trip() {
        for state in [
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Isolated,
        ] {
            assert_eq!(state.as_str().parse::<CircuitState>(), Ok(state));
        }
    }

    #[test]
    fn test_legacy_opened_label_is_rejected() {
        // Some ancestral deployments emitted "Opened"; this one never does,
        // and never accepts it either.
        assert!("Opened".parse::<CircuitState>().is_err());
    }

    #[test]
    fn test_unknown_labels_are_rejected() {
        assert!("closed".parse::<CircuitState>().is_err());
        assert!("HALFOPEN".parse::<CircuitState>().is_err());
        assert!(String::new().parse::<CircuitState>().is_err());
    }

    #[test]
    fn test_allows_calls() {
        assert!(CircuitState::Closed.allows_calls());
        assert!(CircuitState::HalfOpen.allows_calls());
        assert!(!CircuitState::Open.allows_calls());
        assert!(!CircuitState::Isolated.allows_calls());
    }
}
