//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Exit code reported for a process killed after its timeout (matches `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a process could not be spawned (matches shells).
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;
/// Exit code reported for a process terminated by a signal.
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code with timeouts mapped to [`TIMEOUT_EXIT_CODE`].
    pub fn exit_code(&self) -> i32 {
        if self.timed_out {
            return TIMEOUT_EXIT_CODE;
        }
        self.status.code().unwrap_or(SIGNALED_EXIT_CODE)
    }

    /// Only a literal zero exit (and no timeout) counts as success.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.code() == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Render stdout and stderr as one labelled log body.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and output is drained on helper threads while the child runs.
/// `output_limit_bytes` bounds the stdout/stderr kept in memory: the first and
/// last halves are kept and the middle is dropped while the pipe is still
/// drained. On Unix the child leads its own process group; on timeout the
/// whole group is killed and `timed_out` is set, which is not an error. After
/// a normal exit, stragglers left in the group are killed as well so they
/// cannot hold the output pipes open.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || -> Result<()> {
                match child_stdin.write_all(&input) {
                    // The child may exit without reading all of its input.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    other => other.context("write stdin"),
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => {
            kill_stragglers(&child);
            status
        }
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "failed to feed stdin"),
            Err(_) => warn!("stdin writer thread panicked"),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Build a [`Command`] from an argv slice.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Keep at most `limit` bytes of `text`, cutting on a char boundary and noting the cut.
pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..cut], text.len() - cut)
}

/// Kill the child and everything it spawned into its process group.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{Signal, killpg};

    if let Err(err) = killpg(group_of(child)?, Signal::SIGKILL) {
        warn!(err = %err, "failed to kill process group, killing child only");
        child.kill().context("kill command")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

/// The leader has exited; kill whatever is left in its group.
#[cfg(unix)]
fn kill_stragglers(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};

    let group = match group_of(child) {
        Ok(group) => group,
        Err(err) => {
            warn!(err = %err, "cannot resolve process group");
            return;
        }
    };
    match killpg(group, Signal::SIGKILL) {
        Ok(()) => debug!("killed leftover processes"),
        Err(Errno::ESRCH) => {}
        Err(err) => warn!(err = %err, "failed to kill leftover processes"),
    }
}

#[cfg(not(unix))]
fn kill_stragglers(_child: &Child) {}

#[cfg(unix)]
fn group_of(child: &Child) -> Result<nix::unistd::Pid> {
    let pid = i32::try_from(child.id()).context("child pid out of range")?;
    Ok(nix::unistd::Pid::from_raw(pid))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Drain `reader`, keeping the first and last `limit / 2` bytes.
///
/// Returns the kept bytes (with an omission marker line between head and
/// tail) and the number of bytes dropped.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let head_limit = limit / 2;
    let tail_limit = limit - head_limit;
    let mut head = Vec::new();
    let mut tail: VecDeque<u8> = VecDeque::new();
    let mut omitted = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut bytes = &chunk[..n];
        let room = head_limit.saturating_sub(head.len());
        if room > 0 {
            let keep = bytes.len().min(room);
            head.extend_from_slice(&bytes[..keep]);
            bytes = &bytes[keep..];
        }
        tail.extend(bytes);
        if tail.len() > tail_limit {
            let excess = tail.len() - tail_limit;
            tail.drain(..excess);
            omitted += excess;
        }
    }

    if omitted > 0 {
        head.extend_from_slice(format!("\n[... {omitted} bytes omitted ...]\n").as_bytes());
    }
    head.extend(tail);
    Ok((head, omitted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert_eq!(out.exit_code(), 3);
        assert!(!out.succeeded());
        assert_eq!(out.stdout_text(), "out\n");
        assert!(out.render_log("check").contains("err"));
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1000)
            .expect("run");
        assert!(out.succeeded());
        assert_eq!(out.stdout_text(), "hello");
    }

    #[test]
    fn timeout_is_reported_not_raised() {
        let out = run_command_with_timeout(sh("exec sleep 5"), None, Duration::from_millis(100), 1000)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code(), TIMEOUT_EXIT_CODE);
        assert!(!out.succeeded());
    }

    #[test]
    fn output_beyond_limit_keeps_head_and_tail() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout_text(), "ab\n[... 6 bytes omitted ...]\nij");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn last_line_survives_long_output() {
        let out = run_command_with_timeout(
            sh("for i in $(seq 1 500); do echo \"line $i of filler output\"; done; echo final"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.stdout_truncated > 0);
        assert!(out.stdout_text().starts_with("line 1 of"));
        assert!(out.stdout_text().ends_with("line 500 of filler output\nfinal\n"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_pipes() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 5; true"),
            None,
            Duration::from_millis(200),
            1000,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn background_leftovers_do_not_block_exit() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 5 & echo done"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert!(out.succeeded());
        assert_eq!(out.stdout_text(), "done\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn truncate_text_respects_char_boundaries() {
        assert_eq!(truncate_text("short", 10), "short");
        let cut = truncate_text("héllo", 2);
        assert!(cut.starts_with('h'));
        assert!(cut.contains("[truncated"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let cmd = Command::new("/definitely/not/a/binary");
        assert!(run_command_with_timeout(cmd, None, Duration::from_secs(1), 10).is_err());
    }
}
