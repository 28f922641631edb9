//! Circuit breaker over consecutive no-progress and same-error iterations.
//!
//! The counters live in [`LoopState`] so a resumed run keeps its streaks.

use crate::core::types::LoopState;

/// Streak limits. A threshold of `N` trips on the `N`th consecutive iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerThresholds {
    pub no_progress: u32,
    pub same_error: u32,
}

/// Why the breaker opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerTrip {
    NoProgress { count: u32 },
    SameError { signature: String, count: u32 },
}

/// Result of evaluating one iteration. Both streaks are always updated, so
/// both trips may be present at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerVerdict {
    pub no_progress: Option<BreakerTrip>,
    pub same_error: Option<BreakerTrip>,
}

impl BreakerVerdict {
    /// The trip to report; no-progress takes precedence over same-error.
    pub fn trip(&self) -> Option<&BreakerTrip> {
        self.no_progress.as_ref().or(self.same_error.as_ref())
    }
}

/// Fold one iteration into the breaker counters held by `state`.
///
/// `error_signature` is the first error reported by the check gate this
/// iteration (empty when checks reported none). Only that first error is
/// compared, so a gate that reorders its failures will reset the streak.
pub fn evaluate(
    state: &mut LoopState,
    thresholds: BreakerThresholds,
    files_changed: u32,
    error_signature: &str,
) -> BreakerVerdict {
    let mut verdict = BreakerVerdict::default();

    if files_changed == 0 {
        state.no_progress_count = state.no_progress_count.saturating_add(1);
        if state.no_progress_count >= thresholds.no_progress {
            verdict.no_progress = Some(BreakerTrip::NoProgress {
                count: state.no_progress_count,
            });
        }
    } else {
        state.no_progress_count = 0;
    }

    if error_signature.is_empty() {
        state.same_error_count = 0;
        state.last_error_signature.clear();
    } else {
        if error_signature == state.last_error_signature {
            state.same_error_count = state.same_error_count.saturating_add(1);
        } else {
            state.same_error_count = 1;
            state.last_error_signature = error_signature.to_string();
        }
        if state.same_error_count >= thresholds.same_error {
            verdict.same_error = Some(BreakerTrip::SameError {
                signature: error_signature.to_string(),
                count: state.same_error_count,
            });
        }
    }

    verdict
}

/// A trip already recorded in `state`, as left behind by a run that stopped
/// on a streak. No-progress takes precedence, as in [`BreakerVerdict::trip`].
pub fn standing_trip(state: &LoopState, thresholds: BreakerThresholds) -> Option<BreakerTrip> {
    if state.no_progress_count >= thresholds.no_progress {
        return Some(BreakerTrip::NoProgress {
            count: state.no_progress_count,
        });
    }
    if !state.last_error_signature.is_empty() && state.same_error_count >= thresholds.same_error {
        return Some(BreakerTrip::SameError {
            signature: state.last_error_signature.clone(),
            count: state.same_error_count,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: BreakerThresholds = BreakerThresholds {
        no_progress: 3,
        same_error: 3,
    };

    #[test]
    fn no_progress_trips_at_threshold() {
        let mut state = LoopState::default();
        assert_eq!(evaluate(&mut state, THRESHOLDS, 0, "").trip(), None);
        assert_eq!(evaluate(&mut state, THRESHOLDS, 0, "").trip(), None);
        let verdict = evaluate(&mut state, THRESHOLDS, 0, "");
        assert_eq!(
            verdict.trip(),
            Some(&BreakerTrip::NoProgress { count: 3 })
        );
    }

    #[test]
    fn progress_resets_no_progress_streak() {
        let mut state = LoopState::default();
        evaluate(&mut state, THRESHOLDS, 0, "");
        evaluate(&mut state, THRESHOLDS, 0, "");
        evaluate(&mut state, THRESHOLDS, 4, "");
        assert_eq!(state.no_progress_count, 0);
        assert_eq!(evaluate(&mut state, THRESHOLDS, 0, "").trip(), None);
    }

    #[test]
    fn same_error_trips_after_consecutive_sightings() {
        let mut state = LoopState::default();
        assert_eq!(evaluate(&mut state, THRESHOLDS, 1, "test").trip(), None);
        assert_eq!(state.same_error_count, 1);
        assert_eq!(evaluate(&mut state, THRESHOLDS, 1, "test").trip(), None);
        let verdict = evaluate(&mut state, THRESHOLDS, 1, "test");
        assert_eq!(
            verdict.trip(),
            Some(&BreakerTrip::SameError {
                signature: "test".to_string(),
                count: 3
            })
        );
    }

    #[test]
    fn differing_signature_resets_and_rebases() {
        let mut state = LoopState::default();
        evaluate(&mut state, THRESHOLDS, 1, "test");
        evaluate(&mut state, THRESHOLDS, 1, "test");
        evaluate(&mut state, THRESHOLDS, 1, "lint");
        assert_eq!(state.same_error_count, 1);
        assert_eq!(state.last_error_signature, "lint");
    }

    #[test]
    fn empty_signature_resets_counter() {
        let mut state = LoopState::default();
        evaluate(&mut state, THRESHOLDS, 1, "test");
        evaluate(&mut state, THRESHOLDS, 1, "test");
        evaluate(&mut state, THRESHOLDS, 1, "");
        assert_eq!(state.same_error_count, 0);
        assert!(state.last_error_signature.is_empty());
        evaluate(&mut state, THRESHOLDS, 1, "test");
        assert_eq!(state.same_error_count, 1);
    }

    #[test]
    fn both_streaks_update_and_no_progress_wins() {
        let thresholds = BreakerThresholds {
            no_progress: 2,
            same_error: 2,
        };
        let mut state = LoopState::default();
        evaluate(&mut state, thresholds, 0, "build");
        let verdict = evaluate(&mut state, thresholds, 0, "build");
        assert!(verdict.no_progress.is_some());
        assert!(verdict.same_error.is_some());
        assert_eq!(verdict.trip(), Some(&BreakerTrip::NoProgress { count: 2 }));
    }

    #[test]
    fn threshold_of_one_trips_on_first_sighting() {
        let thresholds = BreakerThresholds {
            no_progress: 5,
            same_error: 1,
        };
        let mut state = LoopState::default();
        assert!(evaluate(&mut state, thresholds, 1, "test").same_error.is_some());
    }

    #[test]
    fn standing_trip_reads_persisted_streaks() {
        let mut state = LoopState::default();
        assert_eq!(standing_trip(&state, THRESHOLDS), None);

        state.last_error_signature = "test".to_string();
        state.same_error_count = 3;
        assert_eq!(
            standing_trip(&state, THRESHOLDS),
            Some(BreakerTrip::SameError {
                signature: "test".to_string(),
                count: 3
            })
        );

        state.no_progress_count = 3;
        assert_eq!(
            standing_trip(&state, THRESHOLDS),
            Some(BreakerTrip::NoProgress { count: 3 })
        );

        let raised = BreakerThresholds {
            no_progress: 4,
            same_error: 4,
        };
        assert_eq!(standing_trip(&state, raised), None);
    }

    /// Only the first error is compared: a gate that reports the same failures
    /// in a different order never trips the same-error breaker.
    #[test]
    fn reordered_errors_do_not_trip_known_limitation() {
        let mut state = LoopState::default();
        for sig in ["lint", "test", "lint", "test", "lint"] {
            assert_eq!(evaluate(&mut state, THRESHOLDS, 1, sig).same_error, None);
        }
    }
}
