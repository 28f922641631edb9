//! Per-iteration artifacts under `.loopguard/<loop_id>/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{CheckResult, IterationOutcome};

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub check_path: PathBuf,
    pub prompt_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub outcome_path: PathBuf,
}

impl IterationPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            check_path: dir.join("check.json"),
            prompt_path: dir.join("prompt.md"),
            agent_log_path: dir.join("agent.log"),
            outcome_path: dir.join("outcome.json"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }

    pub fn write_check(&self, result: &CheckResult) -> Result<()> {
        write_json(&self.check_path, result)
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        write_text(&self.prompt_path, prompt)
    }

    pub fn write_outcome(&self, outcome: &IterationOutcome) -> Result<()> {
        write_json(&self.outcome_path, outcome)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cost::Usd;
    use crate::core::types::CheckOutcome;

    #[test]
    fn writes_artifacts_in_iteration_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path().join("iterations").join("1"));
        paths.create().expect("create");

        let check = CheckResult::from_checks("t", vec![CheckOutcome::failed("test", None)]);
        paths.write_check(&check).expect("check");
        paths.write_prompt("do the thing").expect("prompt");
        paths
            .write_outcome(&IterationOutcome {
                iteration: 1,
                start_revision: Some("a".to_string()),
                end_revision: Some("b".to_string()),
                files_changed: 2,
                iteration_cost: Usd::parse("0.1").expect("usd"),
                agent_exit_code: 0,
                timed_out: false,
                committed: true,
                reverted: false,
            })
            .expect("outcome");

        let check_json = fs::read_to_string(&paths.check_path).expect("read");
        let parsed: CheckResult = serde_json::from_str(&check_json).expect("parse");
        assert_eq!(parsed, check);
        assert_eq!(
            fs::read_to_string(&paths.prompt_path).expect("read"),
            "do the thing"
        );
        let outcome = fs::read_to_string(&paths.outcome_path).expect("read");
        assert!(outcome.contains("\"iteration_cost\": \"0.1\""));
    }
}
