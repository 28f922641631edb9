//! The control loop behind `loopguard run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::core::breaker::standing_trip;
use crate::core::budget::{BudgetGuard, remaining_budget};
use crate::core::cost::Usd;
use crate::core::stop::{EventKind, StopReason};
use crate::core::types::LoopState;
use crate::io::agent::AgentInvoker;
use crate::io::checks::{CheckGate, load_plan, now_rfc3339};
use crate::io::config::LoopConfig;
use crate::io::init::{LoopPaths, ensure_runtime_gitignore};
use crate::io::kill_switch::KillSwitch;
use crate::io::progress::Workspace;
use crate::io::prompt::PromptBuilder;
use crate::io::report::{ReportEvent, Reporter, emit_best_effort};
use crate::io::state::{load_or_reset, save_state, save_state_quietly};
use crate::step::run_step;

/// Run-scoped collaborators, threaded explicitly through every iteration.
pub struct LoopContext<'a> {
    pub config: &'a LoopConfig,
    pub paths: &'a LoopPaths,
    pub gate: &'a dyn CheckGate,
    pub agent: &'a dyn AgentInvoker,
    pub workspace: &'a dyn Workspace,
    pub reporter: &'a dyn Reporter,
    pub kill_switch: &'a dyn KillSwitch,
    pub prompt: &'a PromptBuilder,
    /// Set asynchronously (e.g. by a signal handler); polled between iterations.
    pub interrupted: &'a AtomicBool,
    /// Workflow wall-clock deadline.
    pub deadline: Option<Instant>,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub started_at_iteration: u32,
    pub iterations_run: u32,
    pub state: LoopState,
    pub stop: StopReason,
}

impl LoopOutcome {
    pub fn exit_code(&self) -> i32 {
        self.stop.exit_code()
    }
}

/// Last iteration's figures carried into the terminal event.
#[derive(Debug, Clone, Copy, Default)]
struct LastIteration {
    cost: Usd,
    files_changed: u32,
}

/// Iterate until a terminal condition fires.
///
/// Only setup failures (runtime directory, unreadable state file) are returned
/// as `Err`. Runtime failures after the loop started end with
/// [`StopReason::Failure`] after a `failure` event and a best-effort state save.
#[instrument(skip_all, fields(loop_id = %ctx.config.loop_id, mode = ctx.config.mode.as_str()))]
pub fn run_loop(ctx: &LoopContext<'_>) -> Result<LoopOutcome> {
    ensure_runtime_gitignore(ctx.paths)?;
    let mut state = load_or_reset(&ctx.paths.state_path, &ctx.config.loop_id, ctx.config.mode)?;
    let started_at_iteration = state.iteration;
    info!(iteration = state.iteration, total_cost = %state.total_cost, "loop starting");

    let mut last = LastIteration::default();
    let stop = loop {
        if let Some(stop) = boundary_stop(ctx, &state) {
            break stop;
        }

        let checks = match ctx.gate.run() {
            Ok(checks) => checks,
            Err(err) => break failure(err),
        };
        if checks.all_pass {
            info!("all checks pass");
            break StopReason::Success;
        }

        let step = match run_step(ctx, &mut state, &checks) {
            Ok(step) => step,
            Err(err) => break failure(err),
        };
        last = LastIteration {
            cost: step.outcome.iteration_cost,
            files_changed: step.outcome.files_changed,
        };
        if let Err(err) = save_state(&ctx.paths.state_path, &state) {
            break failure(err);
        }
        emit(ctx, &state, EventKind::Iteration, last, None);

        if let Some(stop) = step.stop {
            break stop;
        }
    };

    save_state_quietly(&ctx.paths.state_path, &state);
    emit(ctx, &state, stop.event_kind(), last, Some(stop.detail()));
    info!(reason = stop.as_str(), exit_code = stop.exit_code(), "loop stopped");

    Ok(LoopOutcome {
        started_at_iteration,
        iterations_run: state.iteration.saturating_sub(started_at_iteration),
        state,
        stop,
    })
}

/// Cooperative cancellation points polled before any work each iteration.
///
/// Guards already tripped in the loaded state (a resumed run) stop here,
/// before the agent can be invoked again.
fn boundary_stop(ctx: &LoopContext<'_>, state: &LoopState) -> Option<StopReason> {
    if ctx.interrupted.load(Ordering::SeqCst) {
        warn!("interrupted");
        return Some(StopReason::Interrupted);
    }
    if !ctx.kill_switch.is_enabled() {
        warn!("kill switch disabled the loop");
        return Some(StopReason::KillSwitch);
    }
    if let Some(deadline) = ctx.deadline
        && remaining_budget(deadline).is_none()
    {
        warn!("workflow timeout elapsed");
        return Some(StopReason::Timeout);
    }
    if let Some(exceeded) = BudgetGuard::new(ctx.config.budget_max_usd).check(state.total_cost) {
        warn!(total = %exceeded.total, ceiling = %exceeded.ceiling, "budget already exceeded");
        return Some(StopReason::BudgetExceeded);
    }
    if let Some(trip) = standing_trip(state, ctx.config.thresholds()) {
        warn!(?trip, "circuit breaker already open");
        return Some(StopReason::from(trip));
    }
    if state.iteration >= ctx.config.max_iterations {
        warn!(max_iterations = ctx.config.max_iterations, "max iterations reached");
        return Some(StopReason::MaxIterations {
            max_iterations: ctx.config.max_iterations,
        });
    }
    None
}

fn failure(err: anyhow::Error) -> StopReason {
    error!(err = %format!("{err:#}"), "loop failed");
    StopReason::Failure {
        message: format!("{err:#}"),
    }
}

fn emit(
    ctx: &LoopContext<'_>,
    state: &LoopState,
    kind: EventKind,
    last: LastIteration,
    reason: Option<String>,
) {
    let plan_progress = load_plan(&ctx.paths.root.join(&ctx.config.plan_path))
        .ok()
        .and_then(|plan| plan.fraction());
    let event = ReportEvent {
        event: kind,
        loop_id: state.loop_id.clone(),
        iteration: state.iteration,
        iteration_cost: last.cost,
        total_cost: state.total_cost,
        files_changed: last.files_changed,
        plan_progress,
        reason,
        timestamp: now_rfc3339(),
    };
    emit_best_effort(ctx.reporter, &event);
}
