//! Loop configuration stored in `loopguard.toml` at the workspace root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::breaker::BreakerThresholds;
use crate::core::cost::Usd;
use crate::core::types::{DEFAULT_LOOP_ID, LoopMode};
use crate::io::checks::PLAN_CHECK_NAME;
use crate::io::init::validate_loop_id;

pub const CONFIG_FILE: &str = "loopguard.toml";

/// Configuration problems are fatal before the first iteration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Isolates state, logs and events of concurrent loops on one workspace.
    pub loop_id: String,
    pub mode: LoopMode,
    pub max_iterations: u32,
    /// Cost ceiling in USD. Unset disables the budget guard.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_max_usd: Option<Usd>,
    pub no_progress_threshold: u32,
    pub same_error_threshold: u32,
    /// Wall-clock limit for the whole run. Unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_timeout_secs: Option<u64>,
    /// Markdown checklist consulted in build mode (relative to the workspace).
    pub plan_path: PathBuf,
    /// Optional minijinja template replacing the built-in agent instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_path: Option<PathBuf>,
    /// Record each productive iteration as a git commit.
    pub commit: bool,
    pub agent: AgentConfig,
    pub gate: GateConfig,
    pub report: ReportConfig,
    pub kill_switch: KillSwitchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv; the instruction text is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Bytes of agent stdout/stderr kept in memory and in `agent.log`.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Checks run in order; each passes only on exit code 0.
    pub checks: Vec<CheckSpec>,
    /// Per-check timeout.
    pub timeout_secs: u64,
    /// Bytes of output retained per check in the structured result.
    pub output_limit_bytes: usize,
    /// Skip remaining checks after the first failure.
    pub stop_on_first_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSpec {
    pub name: String,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// Command receiving each event as JSON on stdin (best-effort).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<Vec<String>>,
    pub hook_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Environment variable polled each iteration; `false`/`0` stops the loop.
    pub env: String,
    /// File polled each iteration; same values as `env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            checks: vec![CheckSpec {
                name: "ci".to_string(),
                command: vec!["just".to_string(), "ci".to_string()],
            }],
            timeout_secs: 30 * 60,
            output_limit_bytes: 4_000,
            stop_on_first_failure: false,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            hook: None,
            hook_timeout_secs: 10,
        }
    }
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            env: "LOOPGUARD_ENABLED".to_string(),
            file: None,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loop_id: DEFAULT_LOOP_ID.to_string(),
            mode: LoopMode::Build,
            max_iterations: 20,
            budget_max_usd: None,
            no_progress_threshold: 3,
            same_error_threshold: 3,
            workflow_timeout_secs: None,
            plan_path: PathBuf::from("IMPLEMENTATION_PLAN.md"),
            prompt_path: None,
            commit: true,
            agent: AgentConfig::default(),
            gate: GateConfig::default(),
            report: ReportConfig::default(),
            kill_switch: KillSwitchConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(err) = validate_loop_id(&self.loop_id) {
            return invalid(format!("loop_id: {err}"));
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be > 0".to_string());
        }
        if self.no_progress_threshold == 0 {
            return invalid("no_progress_threshold must be > 0".to_string());
        }
        if self.same_error_threshold == 0 {
            return invalid("same_error_threshold must be > 0".to_string());
        }
        if self.workflow_timeout_secs == Some(0) {
            return invalid("workflow_timeout_secs must be > 0 when set".to_string());
        }
        if !is_valid_argv(&self.agent.command) {
            return invalid("agent.command must be a non-empty array".to_string());
        }
        if self.agent.timeout_secs == 0 {
            return invalid("agent.timeout_secs must be > 0".to_string());
        }
        if self.agent.output_limit_bytes == 0 {
            return invalid("agent.output_limit_bytes must be > 0".to_string());
        }
        if self.gate.timeout_secs == 0 {
            return invalid("gate.timeout_secs must be > 0".to_string());
        }
        let mut seen = Vec::new();
        for check in &self.gate.checks {
            if check.name.trim().is_empty() {
                return invalid("gate.checks[].name must not be empty".to_string());
            }
            if check.name == PLAN_CHECK_NAME {
                return invalid(format!("check name '{PLAN_CHECK_NAME}' is reserved"));
            }
            if seen.contains(&check.name.as_str()) {
                return invalid(format!("duplicate check name '{}'", check.name));
            }
            if !is_valid_argv(&check.command) {
                return invalid(format!(
                    "gate check '{}' command must be a non-empty array",
                    check.name
                ));
            }
            seen.push(check.name.as_str());
        }
        if let Some(hook) = &self.report.hook
            && !is_valid_argv(hook)
        {
            return invalid("report.hook must be a non-empty array when set".to_string());
        }
        if self.kill_switch.env.trim().is_empty() {
            return invalid("kill_switch.env must not be empty".to_string());
        }
        Ok(())
    }

    pub fn thresholds(&self) -> BreakerThresholds {
        BreakerThresholds {
            no_progress: self.no_progress_threshold,
            same_error: self.same_error_threshold,
        }
    }
}

fn invalid(msg: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg))
}

fn is_valid_argv(argv: &[String]) -> bool {
    argv.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}
