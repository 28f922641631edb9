//! Cost ceiling and wall-clock budget helpers.

use std::time::{Duration, Instant};

use crate::core::cost::Usd;
use crate::core::types::LoopState;

/// Tripped when the running total strictly exceeds the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetExceeded {
    pub total: Usd,
    pub ceiling: Usd,
}

/// Accumulates per-iteration cost against an optional ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetGuard {
    ceiling: Option<Usd>,
}

impl BudgetGuard {
    pub fn new(ceiling: Option<Usd>) -> Self {
        Self { ceiling }
    }

    /// Add `cost` (zero when unknown) to `state.total_cost` and check the ceiling.
    pub fn account(&self, state: &mut LoopState, cost: Option<Usd>) -> Option<BudgetExceeded> {
        state.total_cost = state.total_cost + cost.unwrap_or(Usd::ZERO);
        self.check(state.total_cost)
    }

    /// Equality with the ceiling does not trip.
    pub fn check(&self, total: Usd) -> Option<BudgetExceeded> {
        let ceiling = self.ceiling?;
        (total > ceiling).then_some(BudgetExceeded { total, ceiling })
    }
}

/// Remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// Cap a per-call timeout by an optional workflow deadline.
pub fn bounded_timeout(timeout: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => timeout.min(remaining_budget(deadline).unwrap_or(Duration::ZERO)),
        None => timeout,
    }
}
