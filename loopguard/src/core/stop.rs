//! Terminal conditions for the control loop.

use serde::{Deserialize, Serialize};

use crate::core::breaker::BreakerTrip;
use crate::exit_codes;

/// Why the loop stopped. Every variant maps to exactly one report event kind
/// and one process exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// All checks passed.
    Success,
    /// Too many consecutive iterations without file changes.
    NoProgress { count: u32 },
    /// Too many consecutive iterations failing with the same first error.
    SameError { signature: String, count: u32 },
    /// `max_iterations` iterations completed without success.
    MaxIterations { max_iterations: u32 },
    /// The external kill switch reported disabled.
    KillSwitch,
    /// Accumulated cost exceeded the ceiling.
    BudgetExceeded,
    /// Workflow wall-clock timeout elapsed.
    Timeout,
    /// SIGINT/SIGTERM received.
    Interrupted,
    /// Unrecoverable runtime error (git, filesystem).
    Failure { message: String },
}

impl StopReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::Success => exit_codes::OK,
            StopReason::Failure { .. } => exit_codes::INVALID,
            StopReason::NoProgress { .. }
            | StopReason::SameError { .. }
            | StopReason::MaxIterations { .. } => exit_codes::CIRCUIT_BREAKER,
            StopReason::KillSwitch => exit_codes::KILL_SWITCH,
            StopReason::BudgetExceeded => exit_codes::BUDGET_EXCEEDED,
            StopReason::Timeout => exit_codes::TIMEOUT,
            StopReason::Interrupted => exit_codes::INTERRUPTED,
        }
    }

    /// Stable reason string carried in the terminal report event.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Success => "success",
            StopReason::NoProgress { .. } => "no_progress",
            StopReason::SameError { .. } => "same_error",
            StopReason::MaxIterations { .. } => "max_iterations",
            StopReason::KillSwitch => "kill_switch",
            StopReason::BudgetExceeded => "budget_exceeded",
            StopReason::Timeout => "timeout",
            StopReason::Interrupted => "interrupted",
            StopReason::Failure { .. } => "failure",
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            StopReason::Success => EventKind::Success,
            StopReason::NoProgress { .. } => EventKind::Stalled,
            StopReason::SameError { .. } => EventKind::CircuitBreaker,
            StopReason::MaxIterations { .. } => EventKind::MaxIterations,
            StopReason::KillSwitch => EventKind::KillSwitch,
            StopReason::BudgetExceeded => EventKind::BudgetExceeded,
            StopReason::Timeout => EventKind::Timeout,
            StopReason::Interrupted => EventKind::Interrupted,
            StopReason::Failure { .. } => EventKind::Failure,
        }
    }

    /// Human-readable detail for the report event.
    pub fn detail(&self) -> String {
        match self {
            StopReason::NoProgress { count } => {
                format!("no_progress: {count} consecutive iterations without changes")
            }
            StopReason::SameError { signature, count } => {
                format!("same_error: '{signature}' failed {count} consecutive iterations")
            }
            StopReason::MaxIterations { max_iterations } => {
                format!("max_iterations: reached {max_iterations}")
            }
            StopReason::Failure { message } => format!("failure: {message}"),
            other => other.as_str().to_string(),
        }
    }
}

impl From<BreakerTrip> for StopReason {
    fn from(trip: BreakerTrip) -> Self {
        match trip {
            BreakerTrip::NoProgress { count } => StopReason::NoProgress { count },
            BreakerTrip::SameError { signature, count } => {
                StopReason::SameError { signature, count }
            }
        }
    }
}

/// Report event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Iteration,
    Success,
    Failure,
    CircuitBreaker,
    KillSwitch,
    BudgetExceeded,
    Stalled,
    MaxIterations,
    Timeout,
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_process_contract() {
        assert_eq!(StopReason::Success.exit_code(), 0);
        assert_eq!(StopReason::NoProgress { count: 3 }.exit_code(), 2);
        assert_eq!(
            StopReason::SameError {
                signature: "test".to_string(),
                count: 3
            }
            .exit_code(),
            2
        );
        assert_eq!(StopReason::MaxIterations { max_iterations: 5 }.exit_code(), 2);
        assert_eq!(StopReason::KillSwitch.exit_code(), 3);
        assert_eq!(StopReason::BudgetExceeded.exit_code(), 4);
        assert_eq!(StopReason::Timeout.exit_code(), 5);
    }

    #[test]
    fn breaker_trips_map_to_distinct_events() {
        let stalled: StopReason = BreakerTrip::NoProgress { count: 2 }.into();
        let repeated: StopReason = BreakerTrip::SameError {
            signature: "lint".to_string(),
            count: 2,
        }
        .into();
        assert_eq!(stalled.event_kind(), EventKind::Stalled);
        assert_eq!(stalled.as_str(), "no_progress");
        assert_eq!(repeated.event_kind(), EventKind::CircuitBreaker);
        assert_eq!(repeated.as_str(), "same_error");
        assert!(repeated.detail().contains("'lint'"));
    }

    #[test]
    fn event_kinds_serialize_snake_case() {
        let json = serde_json::to_string(&EventKind::BudgetExceeded).expect("serialize");
        assert_eq!(json, "\"budget_exceeded\"");
    }
}
