//! Orchestration for a single agent iteration.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::breaker;
use crate::core::budget::{BudgetGuard, bounded_timeout};
use crate::core::cost::Usd;
use crate::core::stop::StopReason;
use crate::core::types::{CheckResult, IterationOutcome, LoopMode, LoopState};
use crate::io::agent::AgentRequest;
use crate::io::checks::load_plan;
use crate::io::iteration_log::IterationPaths;
use crate::io::prompt::PromptInputs;
use crate::looping::LoopContext;

/// Result of one iteration.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub outcome: IterationOutcome,
    /// Set when a guard tripped during this iteration.
    pub stop: Option<StopReason>,
}

/// Run one iteration against failing `checks`.
///
/// Invokes the agent, measures progress, accounts cost, evaluates the
/// breaker, commits, and in polish mode re-verifies and reverts. `state` is
/// mutated in place; the caller persists it.
#[instrument(skip_all, fields(iteration = state.iteration + 1, mode = ctx.config.mode.as_str()))]
pub fn run_step(
    ctx: &LoopContext<'_>,
    state: &mut LoopState,
    checks: &CheckResult,
) -> Result<StepOutcome> {
    let config = ctx.config;
    let iteration = state.iteration + 1;
    let log = IterationPaths::new(ctx.paths.iteration_dir(iteration));
    log.create()?;
    log.write_check(checks)?;

    let plan = match config.mode {
        LoopMode::Build => Some(load_plan(&ctx.paths.root.join(&config.plan_path))?),
        LoopMode::Polish => None,
    };
    let instructions = ctx.prompt.render(&PromptInputs {
        mode: config.mode,
        loop_id: &config.loop_id,
        iteration,
        max_iterations: config.max_iterations,
        plan_path: &config.plan_path,
        plan: plan.as_ref(),
        checks,
    })?;
    log.write_prompt(&instructions)?;

    let before = ctx.workspace.snapshot().context("snapshot before agent")?;
    let reply = ctx.agent.invoke(&AgentRequest {
        workdir: ctx.paths.root.clone(),
        instructions,
        mode: config.mode,
        loop_id: config.loop_id.clone(),
        timeout: bounded_timeout(Duration::from_secs(config.agent.timeout_secs), ctx.deadline),
        output_limit_bytes: config.agent.output_limit_bytes,
        log_path: log.agent_log_path.clone(),
    })?;
    let after = ctx.workspace.snapshot().context("snapshot after agent")?;
    let files_changed = ctx.workspace.changed_units(&before, &after)?;

    state.iteration = iteration;
    let iteration_cost = reply.cost.unwrap_or(Usd::ZERO);
    let budget = BudgetGuard::new(config.budget_max_usd).account(state, reply.cost);
    let verdict = breaker::evaluate(
        state,
        config.thresholds(),
        files_changed,
        checks.first_error().unwrap_or(""),
    );
    let stop = match (budget, verdict.trip()) {
        (Some(exceeded), _) => {
            warn!(total = %exceeded.total, ceiling = %exceeded.ceiling, "budget exceeded");
            Some(StopReason::BudgetExceeded)
        }
        (None, Some(trip)) => {
            warn!(?trip, "circuit breaker tripped");
            Some(StopReason::from(trip.clone()))
        }
        (None, None) => None,
    };

    let mut committed = false;
    if config.commit && files_changed > 0 {
        let message = format!("loopguard({}): iteration {iteration}", config.loop_id);
        committed = ctx.workspace.commit_all(&message)?.is_some();
    }

    let mut reverted = false;
    if config.mode == LoopMode::Polish && files_changed > 0 {
        let verify = ctx.gate.run().context("re-run checks after polish iteration")?;
        if !verify.all_pass {
            warn!(errors = ?verify.errors, "polish iteration broke checks, reverting");
            ctx.workspace.revert_to(&before)?;
            reverted = true;
        } else {
            debug!("polish iteration verified");
        }
    }

    let end_revision = ctx.workspace.snapshot()?.revision;
    state.last_revision.clone_from(&end_revision);

    let outcome = IterationOutcome {
        iteration,
        start_revision: before.revision,
        end_revision,
        files_changed,
        iteration_cost,
        agent_exit_code: reply.exit_code,
        timed_out: reply.timed_out,
        committed,
        reverted,
    };
    log.write_outcome(&outcome)?;

    info!(
        files_changed,
        cost = %iteration_cost,
        total_cost = %state.total_cost,
        agent_exit_code = reply.exit_code,
        committed,
        reverted,
        "iteration finished"
    );
    Ok(StepOutcome { outcome, stop })
}
