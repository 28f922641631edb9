//! Check gate: runs the configured verification commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::bounded_timeout;
use crate::core::plan::{PlanProgress, parse_plan};
use crate::core::types::{CheckOutcome, CheckResult, CheckStatus};
use crate::io::config::{CheckSpec, GateConfig};
use crate::io::process::{
    SPAWN_FAILED_EXIT_CODE, command_from_argv, run_command_with_timeout, truncate_text,
};

/// Name of the synthetic check that fails while plan items are pending.
pub const PLAN_CHECK_NAME: &str = "plan";

/// Runs verification and reports a structured result.
///
/// A failing check is a normal result, never an `Err`; errors are reserved
/// for the gate itself being unable to run.
pub trait CheckGate {
    fn run(&self) -> Result<CheckResult>;
}

/// Runs each configured command in the workspace; only exit code 0 passes.
#[derive(Debug, Clone)]
pub struct CommandCheckGate {
    workdir: PathBuf,
    config: GateConfig,
    plan_path: Option<PathBuf>,
    deadline: Option<Instant>,
}

impl CommandCheckGate {
    pub fn new(workdir: impl Into<PathBuf>, config: GateConfig) -> Self {
        Self {
            workdir: workdir.into(),
            config,
            plan_path: None,
            deadline: None,
        }
    }

    /// Also fail while `plan_path` still lists pending checklist items.
    pub fn with_plan(mut self, plan_path: impl Into<PathBuf>) -> Self {
        self.plan_path = Some(plan_path.into());
        self
    }

    /// Cap every check timeout by the workflow deadline.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    fn run_check(&self, spec: &CheckSpec) -> CheckOutcome {
        let timeout = bounded_timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.deadline,
        );
        let started = Instant::now();
        let result = command_from_argv(&spec.command).and_then(|mut cmd| {
            cmd.current_dir(&self.workdir);
            run_command_with_timeout(cmd, None, timeout, self.config.output_limit_bytes)
        });
        let duration_secs = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => {
                let passed = output.succeeded();
                debug!(
                    check = %spec.name,
                    exit_code = output.exit_code(),
                    timed_out = output.timed_out,
                    passed,
                    "check finished"
                );
                let log = truncate_text(
                    &output.render_log(&spec.name),
                    self.config.output_limit_bytes,
                );
                CheckOutcome {
                    name: spec.name.clone(),
                    status: if passed {
                        CheckStatus::Pass
                    } else {
                        CheckStatus::Fail
                    },
                    duration_secs,
                    exit_code: Some(output.exit_code()),
                    output: (!passed).then_some(log),
                }
            }
            Err(err) => {
                warn!(check = %spec.name, err = %err, "check could not be started");
                CheckOutcome {
                    name: spec.name.clone(),
                    status: CheckStatus::Fail,
                    duration_secs,
                    exit_code: Some(SPAWN_FAILED_EXIT_CODE),
                    output: Some(format!("{err:#}")),
                }
            }
        }
    }
}

impl CheckGate for CommandCheckGate {
    #[instrument(skip_all, fields(checks = self.config.checks.len()))]
    fn run(&self) -> Result<CheckResult> {
        let mut result = CheckResult::from_checks(now_rfc3339(), Vec::new());
        for spec in &self.config.checks {
            if self.config.stop_on_first_failure && !result.all_pass {
                result.push(CheckOutcome::skipped(&spec.name));
                continue;
            }
            result.push(self.run_check(spec));
        }

        if let Some(plan_path) = &self.plan_path {
            let plan = load_plan(&self.workdir.join(plan_path))?;
            if plan.has_pending() {
                debug!(pending = plan.pending, "plan has pending items");
                result.push(plan_outcome(&plan));
            } else {
                result.push(CheckOutcome::passed(PLAN_CHECK_NAME));
            }
        }

        info!(all_pass = result.all_pass, errors = ?result.errors, "check gate finished");
        Ok(result)
    }
}

fn plan_outcome(plan: &PlanProgress) -> CheckOutcome {
    let mut output = format!("{} of {} plan items pending:\n", plan.pending, plan.total());
    for item in &plan.pending_items {
        output.push_str("- [ ] ");
        output.push_str(item);
        output.push('\n');
    }
    CheckOutcome::failed(PLAN_CHECK_NAME, Some(output))
}

/// Read and parse the plan checklist. A missing file means no pending work.
pub fn load_plan(path: &Path) -> Result<PlanProgress> {
    if !path.exists() {
        debug!(path = %path.display(), "no plan file");
        return Ok(PlanProgress::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    Ok(parse_plan(&contents))
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> CheckSpec {
        CheckSpec {
            name: name.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        }
    }

    fn gate(dir: &Path, checks: Vec<CheckSpec>) -> CommandCheckGate {
        CommandCheckGate::new(
            dir,
            GateConfig {
                checks,
                timeout_secs: 10,
                output_limit_bytes: 4_000,
                stop_on_first_failure: false,
            },
        )
    }

    #[test]
    fn all_passing_checks_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate(temp.path(), vec![sh("build", "true"), sh("test", "exit 0")])
            .run()
            .expect("run");
        assert!(result.all_pass);
        assert!(result.errors.is_empty());
        assert_eq!(result.checks.len(), 2);
        assert!(result.checks.iter().all(|c| c.output.is_none()));
    }

    #[test]
    fn nonzero_exit_fails_and_keeps_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate(
            temp.path(),
            vec![
                sh("build", "true"),
                sh("test", "echo 'assertion failed' >&2; exit 1"),
                sh("lint", "exit 2"),
            ],
        )
        .run()
        .expect("run");
        assert!(!result.all_pass);
        assert_eq!(result.errors, vec!["test", "lint"]);
        assert_eq!(result.first_error(), Some("test"));
        let test = &result.checks[1];
        assert_eq!(test.exit_code, Some(1));
        assert!(
            test.output
                .as_deref()
                .is_some_and(|o| o.contains("assertion failed"))
        );
    }

    #[test]
    fn checks_run_in_the_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("marker"), "x").expect("write");
        let result = gate(temp.path(), vec![sh("marker", "test -f marker")])
            .run()
            .expect("run");
        assert!(result.all_pass);
    }

    #[test]
    fn stop_on_first_failure_skips_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gate = gate(
            temp.path(),
            vec![sh("build", "exit 1"), sh("test", "true")],
        );
        gate.config.stop_on_first_failure = true;
        let result = gate.run().expect("run");
        assert_eq!(result.errors, vec!["build"]);
        assert_eq!(result.checks[1].status, CheckStatus::Skipped);
    }

    #[test]
    fn missing_program_is_a_failed_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CheckSpec {
            name: "ghost".to_string(),
            command: vec!["/definitely/not/a/binary".to_string()],
        };
        let result = gate(temp.path(), vec![spec]).run().expect("run");
        assert_eq!(result.errors, vec!["ghost"]);
        assert_eq!(result.checks[0].exit_code, Some(SPAWN_FAILED_EXIT_CODE));
    }

    #[test]
    fn output_is_truncated_to_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut gate = gate(
            temp.path(),
            vec![sh("noisy", "yes noise | head -c 20000; exit 1")],
        );
        gate.config.output_limit_bytes = 200;
        let result = gate.run().expect("run");
        let output = result.checks[0].output.as_deref().expect("output");
        assert!(output.len() < 400);
        assert!(output.contains("[truncated"));
    }

    #[test]
    fn pending_plan_items_fail_the_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("PLAN.md"),
            "- [x] scaffold\n- [ ] wire the cli\n",
        )
        .expect("write");
        let result = gate(temp.path(), vec![sh("build", "true")])
            .with_plan("PLAN.md")
            .run()
            .expect("run");
        assert!(!result.all_pass);
        assert_eq!(result.errors, vec![PLAN_CHECK_NAME]);
        let plan = result.checks.last().expect("plan check");
        assert!(
            plan.output
                .as_deref()
                .is_some_and(|o| o.contains("wire the cli"))
        );
    }

    #[test]
    fn finished_or_missing_plan_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate(temp.path(), vec![])
            .with_plan("PLAN.md")
            .run()
            .expect("run");
        assert!(result.all_pass);

        fs::write(temp.path().join("PLAN.md"), "- [x] done\n").expect("write");
        let result = gate(temp.path(), vec![])
            .with_plan("PLAN.md")
            .run()
            .expect("run");
        assert!(result.all_pass);
    }

    #[test]
    fn no_checks_passes_vacuously() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = gate(temp.path(), vec![]).run().expect("run");
        assert!(result.all_pass);
        assert!(result.checks.is_empty());
    }
}
