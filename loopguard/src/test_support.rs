//! Test-only helpers: a scratch git repository and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::cost::Usd;
use crate::core::types::{CheckOutcome, CheckResult};
use crate::io::agent::{AgentInvoker, AgentReply, AgentRequest};
use crate::io::checks::CheckGate;
use crate::io::config::LoopConfig;
use crate::io::init::LoopPaths;
use crate::io::progress::GitWorkspace;
use crate::io::prompt::PromptBuilder;
use crate::io::report::{ReportEvent, Reporter};
use crate::looping::{LoopContext, LoopOutcome, run_loop};

/// Temporary git repository with one commit (`README.md` = "hello\n").
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.name", "Loop Test"])?;
        repo.git(&["config", "user.email", "loop@example.com"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "hello\n")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        write_file(self.path(), rel, contents)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        fs::read_to_string(self.path().join(rel)).with_context(|| format!("read {rel}"))
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .context("spawn git")?;
        if !out.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    pub fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }
}

fn write_file(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

/// Passing result with the given check names.
pub fn passing(names: &[&str]) -> CheckResult {
    CheckResult::from_checks(
        "test",
        names.iter().map(|name| CheckOutcome::passed(*name)).collect(),
    )
}

/// Result where every named check failed, in order.
pub fn failing(names: &[&str]) -> CheckResult {
    CheckResult::from_checks(
        "test",
        names
            .iter()
            .map(|name| CheckOutcome::failed(*name, Some(format!("{name} failed"))))
            .collect(),
    )
}

/// Returns scripted results in order; the last one repeats forever.
pub struct ScriptedCheckGate {
    results: RefCell<VecDeque<CheckResult>>,
    runs: Cell<u32>,
}

impl ScriptedCheckGate {
    pub fn new(results: Vec<CheckResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            runs: Cell::new(0),
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.get()
    }
}

impl CheckGate for ScriptedCheckGate {
    fn run(&self) -> Result<CheckResult> {
        self.runs.set(self.runs.get() + 1);
        let mut results = self.results.borrow_mut();
        if results.len() > 1 {
            return results.pop_front().ok_or_else(|| anyhow!("no scripted result"));
        }
        results
            .front()
            .cloned()
            .ok_or_else(|| anyhow!("no scripted check results"))
    }
}

/// One scripted agent turn.
#[derive(Debug, Clone, Default)]
pub struct AgentTurn {
    /// Files written relative to the workspace.
    pub writes: Vec<(String, String)>,
    pub cost: Option<Usd>,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl AgentTurn {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn costing(dollars: &str) -> Self {
        Self {
            cost: Usd::parse(dollars),
            ..Self::default()
        }
    }

    pub fn write(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }
}

/// Applies scripted turns in order; once exhausted it stays idle.
#[derive(Default)]
pub struct ScriptedAgent {
    turns: RefCell<VecDeque<AgentTurn>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<AgentTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }
}

impl AgentInvoker for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        self.requests.borrow_mut().push(request.clone());
        let turn = self.turns.borrow_mut().pop_front().unwrap_or_default();
        for (rel, contents) in &turn.writes {
            write_file(&request.workdir, rel, contents)?;
        }
        fs::write(&request.log_path, "scripted agent\n")
            .with_context(|| format!("write {}", request.log_path.display()))?;
        Ok(AgentReply {
            output: String::new(),
            exit_code: turn.exit_code,
            timed_out: turn.timed_out,
            cost: turn.cost,
        })
    }
}

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct RecordingReporter {
    events: RefCell<Vec<ReportEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.borrow().clone()
    }
}

impl Reporter for RecordingReporter {
    fn emit(&self, event: &ReportEvent) -> Result<()> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }
}

/// A full loop wired to scripted collaborators over a real git repository.
pub struct TestHarness {
    pub repo: TestRepo,
    pub config: LoopConfig,
    pub gate: ScriptedCheckGate,
    pub agent: ScriptedAgent,
    pub reporter: RecordingReporter,
    pub enabled: AtomicBool,
    pub interrupted: AtomicBool,
    pub deadline: Option<Instant>,
}

impl TestHarness {
    pub fn new(config: LoopConfig, gate: Vec<CheckResult>, agent: Vec<AgentTurn>) -> Result<Self> {
        Ok(Self {
            repo: TestRepo::new()?,
            config,
            gate: ScriptedCheckGate::new(gate),
            agent: ScriptedAgent::new(agent),
            reporter: RecordingReporter::default(),
            enabled: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            deadline: None,
        })
    }

    pub fn paths(&self) -> LoopPaths {
        LoopPaths::new(self.repo.path(), &self.config.loop_id)
    }

    pub fn root(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    pub fn run(&self) -> Result<LoopOutcome> {
        let paths = self.paths();
        let workspace = GitWorkspace::new(self.repo.path());
        let prompt = PromptBuilder::new()?;
        let kill_switch = || self.enabled.load(Ordering::SeqCst);
        run_loop(&LoopContext {
            config: &self.config,
            paths: &paths,
            gate: &self.gate,
            agent: &self.agent,
            workspace: &workspace,
            reporter: &self.reporter,
            kill_switch: &kill_switch,
            prompt: &prompt,
            interrupted: &self.interrupted,
            deadline: self.deadline,
        })
    }
}
