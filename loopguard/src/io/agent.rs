//! Agent abstraction for one autonomous iteration.
//!
//! The [`AgentInvoker`] trait decouples the control loop from the actual
//! agent backend (any argv that reads instructions on stdin). Tests use
//! scripted agents that edit the workspace without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::cost::{Usd, extract_cost};
use crate::core::types::LoopMode;
use crate::io::process::{
    CommandOutput, SPAWN_FAILED_EXIT_CODE, command_from_argv, run_command_with_timeout,
};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Instruction text fed to the agent on stdin.
    pub instructions: String,
    pub mode: LoopMode,
    pub loop_id: String,
    /// Maximum time to wait for the agent.
    pub timeout: Duration,
    /// Bytes of stdout/stderr retained.
    pub output_limit_bytes: usize,
    /// Where to write the agent's stdout/stderr log.
    pub log_path: PathBuf,
}

/// What the agent reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Agent stdout.
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Self-reported cost, when the output carried one.
    pub cost: Option<Usd>,
}

/// Abstraction over agent backends.
///
/// A non-zero exit or a timeout is a normal reply; `Err` is reserved for
/// failures of the harness itself (e.g. the log cannot be written).
pub trait AgentInvoker {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply>;
}

/// Agent that spawns a configured command.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    argv: Vec<String>,
}

impl CommandAgent {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl AgentInvoker for CommandAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), mode = request.mode.as_str()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentReply> {
        info!(workdir = %request.workdir.display(), program = ?self.argv.first(), "invoking agent");

        let mut cmd = command_from_argv(&self.argv)?;
        cmd.current_dir(&request.workdir)
            .env("LOOPGUARD_MODE", request.mode.as_str())
            .env("LOOPGUARD_LOOP_ID", &request.loop_id);

        let output = match run_command_with_timeout(
            cmd,
            Some(request.instructions.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "agent could not be started");
                write_agent_log(&request.log_path, &format!("[agent spawn failed: {err:#}]\n"))?;
                return Ok(AgentReply {
                    output: String::new(),
                    exit_code: SPAWN_FAILED_EXIT_CODE,
                    timed_out: false,
                    cost: None,
                });
            }
        };

        write_agent_log(&request.log_path, &output.render_log("agent"))?;
        Ok(reply_from_output(&output))
    }
}

fn reply_from_output(output: &CommandOutput) -> AgentReply {
    let text = output.stdout_text();
    let cost = extract_cost(&text);
    if output.timed_out {
        warn!("agent timed out");
    } else if !output.succeeded() {
        warn!(exit_code = output.exit_code(), "agent exited with failure");
    }
    debug!(cost = ?cost.map(|c| c.to_string()), "agent finished");
    AgentReply {
        output: text,
        exit_code: output.exit_code(),
        timed_out: output.timed_out,
        cost,
    }
}

fn write_agent_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write agent log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::process::TIMEOUT_EXIT_CODE;

    fn request(dir: &Path, timeout: Duration) -> AgentRequest {
        AgentRequest {
            workdir: dir.to_path_buf(),
            instructions: "fix the build".to_string(),
            mode: LoopMode::Polish,
            loop_id: "nightly".to_string(),
            timeout,
            output_limit_bytes: 10_000,
            log_path: dir.join("logs").join("agent.log"),
        }
    }

    fn sh(script: &str) -> CommandAgent {
        CommandAgent::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    #[test]
    fn parses_cost_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh(r#"cat > /dev/null; echo '{"result":"ok","total_cost_usd":0.42}'"#);
        let req = request(temp.path(), Duration::from_secs(10));
        let reply = agent.invoke(&req).expect("invoke");
        assert_eq!(reply.exit_code, 0);
        assert!(!reply.timed_out);
        assert_eq!(reply.cost, Usd::parse("0.42"));
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("total_cost_usd"));
    }

    #[test]
    fn cost_record_after_long_stream_is_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh(concat!(
            "cat > /dev/null; ",
            r#"for i in $(seq 1 200); do echo "{\"type\":\"assistant\",\"n\":$i}"; done; "#,
            r#"echo '{"type":"result","total_cost_usd":7.5}'"#,
        ));
        let mut req = request(temp.path(), Duration::from_secs(10));
        req.output_limit_bytes = 4096;
        let reply = agent.invoke(&req).expect("invoke");
        assert_eq!(reply.cost, Usd::parse("7.5"));
    }

    #[test]
    fn instructions_and_env_reach_the_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = sh(r#"cat > got.txt; echo "$LOOPGUARD_MODE $LOOPGUARD_LOOP_ID" > env.txt"#);
        agent
            .invoke(&request(temp.path(), Duration::from_secs(10)))
            .expect("invoke");
        assert_eq!(
            fs::read_to_string(temp.path().join("got.txt")).expect("read"),
            "fix the build"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("env.txt")).expect("read"),
            "polish nightly\n"
        );
    }

    #[test]
    fn failure_exit_is_a_reply_without_cost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reply = sh("echo 'no json here'; exit 7")
            .invoke(&request(temp.path(), Duration::from_secs(10)))
            .expect("invoke");
        assert_eq!(reply.exit_code, 7);
        assert_eq!(reply.cost, None);
    }

    #[test]
    fn timeout_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reply = sh("exec sleep 5")
            .invoke(&request(temp.path(), Duration::from_millis(100)))
            .expect("invoke");
        assert!(reply.timed_out);
        assert_eq!(reply.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn missing_binary_is_absorbed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), Duration::from_secs(1));
        let reply = CommandAgent::new(vec!["/definitely/not/an/agent".to_string()])
            .invoke(&req)
            .expect("invoke");
        assert_eq!(reply.exit_code, SPAWN_FAILED_EXIT_CODE);
        assert!(req.log_path.is_file());
    }
}
