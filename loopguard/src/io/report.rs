//! Report events: one JSON object per iteration and one terminal event.
//!
//! Events are appended to `.loopguard/<loop_id>/events.jsonl` and optionally
//! piped to a user hook command. Reporting never decides loop control flow:
//! failures are logged and dropped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::cost::Usd;
use crate::core::stop::EventKind;
use crate::io::process::{command_from_argv, run_command_with_timeout};

const HOOK_OUTPUT_LIMIT_BYTES: usize = 16 * 1024;

/// One report event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEvent {
    pub event: EventKind,
    pub loop_id: String,
    pub iteration: u32,
    pub iteration_cost: Usd,
    pub total_cost: Usd,
    pub files_changed: u32,
    /// Fraction of plan items done, when a plan is tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: String,
}

/// Sink for report events.
pub trait Reporter {
    fn emit(&self, event: &ReportEvent) -> Result<()>;
}

/// Emit and swallow failures.
pub fn emit_best_effort<R: Reporter + ?Sized>(reporter: &R, event: &ReportEvent) {
    if let Err(err) = reporter.emit(event) {
        warn!(event = ?event.event, err = %err, "report event dropped");
    }
}

/// Appends events as JSON lines.
#[derive(Debug, Clone)]
pub struct JsonlReporter {
    path: PathBuf,
}

impl JsonlReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonlReporter {
    fn emit(&self, event: &ReportEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create events dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize report event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open events {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append events {}", self.path.display()))?;
        debug!(event = ?event.event, iteration = event.iteration, "event recorded");
        Ok(())
    }
}

/// Pipes each event as JSON to a user command.
#[derive(Debug, Clone)]
pub struct HookReporter {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl HookReporter {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            workdir: workdir.into(),
            timeout,
        }
    }
}

impl Reporter for HookReporter {
    fn emit(&self, event: &ReportEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("serialize report event")?;
        let mut cmd = command_from_argv(&self.argv)?;
        cmd.current_dir(&self.workdir);
        let output =
            run_command_with_timeout(cmd, Some(&payload), self.timeout, HOOK_OUTPUT_LIMIT_BYTES)
                .context("run report hook")?;
        if !output.succeeded() {
            return Err(anyhow!(
                "report hook exited with {}{}",
                output.exit_code(),
                if output.timed_out { " (timed out)" } else { "" }
            ));
        }
        Ok(())
    }
}

/// Fans one event out to several reporters; every sink is tried.
#[derive(Default)]
pub struct MultiReporter {
    sinks: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Reporter + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Reporter for MultiReporter {
    fn emit(&self, event: &ReportEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(event) {
                warn!(err = %err, "report sink failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Read back every event from a JSONL file; missing file means none.
pub fn read_events(path: &std::path::Path) -> Result<Vec<ReportEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read events {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("parse report event"))
        .collect()
}
