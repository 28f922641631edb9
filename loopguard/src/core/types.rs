//! Shared deterministic types for loop core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

use crate::core::cost::Usd;

/// Loop identifier used when none is configured.
pub const DEFAULT_LOOP_ID: &str = "default";

/// Operating mode for the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Work through the plan; the gate also fails while plan items are pending.
    #[default]
    Build,
    /// Only keep iterations that leave the checks green.
    Polish,
}

impl LoopMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopMode::Build => "build",
            LoopMode::Polish => "polish",
        }
    }
}

/// Persisted loop bookkeeping (`.loopguard/<loop_id>/state.json`).
///
/// `iteration` and `total_cost` only ever move forward within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopState {
    pub loop_id: String,
    pub mode: LoopMode,
    /// Number of completed iterations.
    pub iteration: u32,
    /// Sum of every parsed per-iteration cost.
    pub total_cost: Usd,
    /// Consecutive iterations that changed nothing.
    pub no_progress_count: u32,
    /// First reported check error of the previous iteration (empty if none).
    pub last_error_signature: String,
    /// Consecutive iterations reporting `last_error_signature`.
    pub same_error_count: u32,
    /// Workspace revision at the end of the last iteration.
    pub last_revision: Option<String>,
}

impl LoopState {
    pub fn new(loop_id: impl Into<String>, mode: LoopMode) -> Self {
        Self {
            loop_id: loop_id.into(),
            mode,
            iteration: 0,
            total_cost: Usd::ZERO,
            no_progress_count: 0,
            last_error_signature: String::new(),
            same_error_count: 0,
            last_revision: None,
        }
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_ID, LoopMode::Build)
    }
}

/// Outcome of one named check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

/// Per-check detail inside a [`CheckResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub status: CheckStatus,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, truncated to the configured limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl CheckOutcome {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Pass,
            duration_secs: 0.0,
            exit_code: Some(0),
            output: None,
        }
    }

    pub fn failed(name: impl Into<String>, output: Option<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Fail,
            duration_secs: 0.0,
            exit_code: None,
            output,
        }
    }

    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Skipped,
            duration_secs: 0.0,
            exit_code: None,
            output: None,
        }
    }
}

/// Structured result of one check gate invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// RFC 3339 timestamp of when the gate ran.
    pub timestamp: String,
    pub all_pass: bool,
    pub checks: Vec<CheckOutcome>,
    /// Names of failed checks, in run order.
    pub errors: Vec<String>,
}

impl CheckResult {
    /// Build a result from ordered outcomes; `all_pass` holds iff nothing failed.
    pub fn from_checks(timestamp: impl Into<String>, checks: Vec<CheckOutcome>) -> Self {
        let errors: Vec<String> = checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(|c| c.name.clone())
            .collect();
        Self {
            timestamp: timestamp.into(),
            all_pass: errors.is_empty(),
            checks,
            errors,
        }
    }

    /// Append a check outcome, keeping `all_pass`/`errors` consistent.
    pub fn push(&mut self, outcome: CheckOutcome) {
        if outcome.status == CheckStatus::Fail {
            self.errors.push(outcome.name.clone());
            self.all_pass = false;
        }
        self.checks.push(outcome);
    }

    /// First reported error (the failed check name), if any.
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }
}

/// What one agent iteration did to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationOutcome {
    pub iteration: u32,
    pub start_revision: Option<String>,
    pub end_revision: Option<String>,
    pub files_changed: u32,
    pub iteration_cost: Usd,
    pub agent_exit_code: i32,
    pub timed_out: bool,
    /// Changes were recorded as a commit.
    pub committed: bool,
    /// Polish mode rolled the iteration back after failed re-verification.
    pub reverted: bool,
}
