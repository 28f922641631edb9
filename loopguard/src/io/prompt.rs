//! Agent instruction rendering.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::plan::PlanProgress;
use crate::core::types::{CheckResult, LoopMode};

const INSTRUCTIONS_TEMPLATE: &str = include_str!("prompts/instructions.md");

/// Everything the instruction template can see.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub mode: LoopMode,
    pub loop_id: &'a str,
    /// 1-based number of the iteration about to run.
    pub iteration: u32,
    pub max_iterations: u32,
    pub plan_path: &'a Path,
    pub plan: Option<&'a PlanProgress>,
    pub checks: &'a CheckResult,
}

#[derive(Debug, Serialize)]
struct FailingCheck<'a> {
    name: &'a str,
    exit_code: Option<i32>,
    output: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PlanContext<'a> {
    done: u32,
    pending: u32,
    total: u32,
    pending_items: &'a [String],
}

/// Template engine wrapper around minijinja.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    source: String,
}

impl PromptBuilder {
    /// Use the built-in instructions.
    pub fn new() -> Result<Self> {
        Self::with_source(INSTRUCTIONS_TEMPLATE.to_string())
    }

    /// Use a user template instead of the built-in one.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("read prompt template {}", path.display()))?;
        Self::with_source(source).with_context(|| format!("load template {}", path.display()))
    }

    /// Built-in template, or `override_path` (relative to `root`) when set.
    pub fn load(root: &Path, override_path: Option<&PathBuf>) -> Result<Self> {
        match override_path {
            Some(path) => Self::from_file(&root.join(path)),
            None => Self::new(),
        }
    }

    fn with_source(source: String) -> Result<Self> {
        Environment::new()
            .template_from_str(&source)
            .context("parse instruction template")?;
        Ok(Self { source })
    }

    pub fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let failing: Vec<FailingCheck<'_>> = input
            .checks
            .failed_checks()
            .map(|check| FailingCheck {
                name: &check.name,
                exit_code: check.exit_code,
                output: check
                    .output
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty()),
            })
            .collect();
        let plan = input.plan.map(|plan| PlanContext {
            done: plan.done,
            pending: plan.pending,
            total: plan.total(),
            pending_items: &plan.pending_items,
        });

        let env = Environment::new();
        let template = env.template_from_str(&self.source)?;
        let rendered = template
            .render(context! {
                mode => input.mode.as_str(),
                loop_id => input.loop_id,
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                plan_path => input.plan_path.display().to_string(),
                plan => plan,
                failing => failing,
            })
            .context("render instructions")?;
        debug!(bytes = rendered.len(), "rendered agent instructions");
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::parse_plan;
    use crate::core::types::CheckOutcome;

    fn failing_result() -> CheckResult {
        let mut test = CheckOutcome::failed("test", Some("thread 'main' panicked".to_string()));
        test.exit_code = Some(101);
        CheckResult::from_checks("t", vec![CheckOutcome::passed("build"), test])
    }

    #[test]
    fn build_prompt_lists_plan_and_failures() {
        let plan = parse_plan("- [x] parse config\n- [ ] wire the cli\n");
        let checks = failing_result();
        let rendered = PromptBuilder::new()
            .expect("builder")
            .render(&PromptInputs {
                mode: LoopMode::Build,
                loop_id: "default",
                iteration: 2,
                max_iterations: 10,
                plan_path: Path::new("IMPLEMENTATION_PLAN.md"),
                plan: Some(&plan),
                checks: &checks,
            })
            .expect("render");
        assert!(rendered.contains("iteration 2 of 10"));
        assert!(rendered.contains("IMPLEMENTATION_PLAN.md"));
        assert!(rendered.contains("1 of 2 items done"));
        assert!(rendered.contains("- [ ] wire the cli"));
        assert!(rendered.contains("### test (exit 101)"));
        assert!(rendered.contains("thread 'main' panicked"));
        assert!(!rendered.contains("### build"));
    }

    #[test]
    fn polish_prompt_mentions_rollback_and_skips_plan() {
        let checks = CheckResult::from_checks("t", vec![CheckOutcome::passed("build")]);
        let rendered = PromptBuilder::new()
            .expect("builder")
            .render(&PromptInputs {
                mode: LoopMode::Polish,
                loop_id: "nightly",
                iteration: 1,
                max_iterations: 5,
                plan_path: Path::new("IMPLEMENTATION_PLAN.md"),
                plan: None,
                checks: &checks,
            })
            .expect("render");
        assert!(rendered.contains("rolled back"));
        assert!(rendered.contains("All checks passed"));
        assert!(!rendered.contains("Pending items"));
    }

    #[test]
    fn custom_template_overrides_builtin() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("prompt.md"),
            "{{ mode }}:{% for c in failing %}{{ c.name }}{% endfor %}",
        )
        .expect("write");
        let builder =
            PromptBuilder::load(temp.path(), Some(&PathBuf::from("prompt.md"))).expect("load");
        let checks = failing_result();
        let rendered = builder
            .render(&PromptInputs {
                mode: LoopMode::Build,
                loop_id: "default",
                iteration: 1,
                max_iterations: 1,
                plan_path: Path::new("PLAN.md"),
                plan: None,
                checks: &checks,
            })
            .expect("render");
        assert_eq!(rendered, "build:test");
    }

    #[test]
    fn broken_template_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("prompt.md"), "{% if %}").expect("write");
        assert!(PromptBuilder::load(temp.path(), Some(&PathBuf::from("prompt.md"))).is_err());
    }
}
