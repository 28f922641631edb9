//! Autonomous iteration-control harness for coding agents.
//!
//! Runs an agent against the current workspace until the configured checks
//! pass or a guard stops the loop. The exit code tells which guard fired.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use loopguard::core::cost::Usd;
use loopguard::core::types::LoopMode;
use loopguard::exit_codes;
use loopguard::io::agent::CommandAgent;
use loopguard::io::checks::{CheckGate, CommandCheckGate};
use loopguard::io::config::{CONFIG_FILE, LoopConfig, load_config};
use loopguard::io::init::{InitOptions, LoopPaths, init_workspace, validate_loop_id};
use loopguard::io::kill_switch::AnyKillSwitch;
use loopguard::io::progress::GitWorkspace;
use loopguard::io::prompt::PromptBuilder;
use loopguard::io::report::{HookReporter, JsonlReporter, MultiReporter};
use loopguard::io::state::load_state;
use loopguard::logging;
use loopguard::looping::{LoopContext, run_loop};

#[derive(Parser)]
#[command(
    name = "loopguard",
    version,
    about = "Run a coding agent until the checks pass or a guard trips"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `loopguard.toml` and the `.loopguard/` runtime directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Iterate until the checks pass or a guard stops the loop.
    Run(RunArgs),
    /// Print the persisted loop state as JSON.
    Status(LoopSelector),
    /// Delete the persisted loop state so the next run starts from zero.
    Reset(LoopSelector),
    /// Run the check gate once and print the result as JSON (exit 0 on pass, 2 on failure).
    Check(LoopSelector),
}

#[derive(Args, Debug, Default)]
struct LoopSelector {
    /// Loop identifier (overrides `loop_id` in the config).
    #[arg(long)]
    loop_id: Option<String>,
    /// Operating mode (overrides `mode` in the config).
    #[arg(long, value_enum)]
    mode: Option<LoopMode>,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[command(flatten)]
    selector: LoopSelector,
    /// Stop after this many completed iterations.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Stop once the accumulated agent cost exceeds this many USD.
    #[arg(long, value_parser = parse_usd)]
    budget_max_usd: Option<Usd>,
    /// Wall-clock limit for the whole run, in seconds.
    #[arg(long)]
    workflow_timeout_secs: Option<u64>,
}

fn parse_usd(raw: &str) -> Result<Usd, String> {
    Usd::parse(raw).ok_or_else(|| format!("invalid USD amount '{raw}'"))
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run(args) => cmd_run(&root, &args),
        Command::Status(selector) => cmd_status(&root, &selector),
        Command::Reset(selector) => cmd_reset(&root, &selector),
        Command::Check(selector) => cmd_check(&root, &selector),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

/// Load `loopguard.toml` and apply command-line overrides.
fn load_effective_config(root: &Path, selector: &LoopSelector) -> Result<LoopConfig> {
    let mut config = load_config(&root.join(CONFIG_FILE))?;
    if let Some(loop_id) = &selector.loop_id {
        validate_loop_id(loop_id).context("--loop-id")?;
        config.loop_id.clone_from(loop_id);
    }
    if let Some(mode) = selector.mode {
        config.mode = mode;
    }
    Ok(config)
}

fn build_gate(root: &Path, config: &LoopConfig, deadline: Option<Instant>) -> CommandCheckGate {
    let gate = CommandCheckGate::new(root, config.gate.clone()).with_deadline(deadline);
    match config.mode {
        LoopMode::Build => gate.with_plan(config.plan_path.clone()),
        LoopMode::Polish => gate,
    }
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<i32> {
    let mut config = load_effective_config(root, &args.selector)?;
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if args.budget_max_usd.is_some() {
        config.budget_max_usd = args.budget_max_usd;
    }
    if args.workflow_timeout_secs.is_some() {
        config.workflow_timeout_secs = args.workflow_timeout_secs;
    }
    config.validate()?;

    let workspace = GitWorkspace::new(root);
    if !workspace.git().is_repo()? {
        bail!("{} is not a git repository", root.display());
    }

    let paths = LoopPaths::new(root, &config.loop_id);
    let deadline = config
        .workflow_timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let gate = build_gate(root, &config, deadline);
    let agent = CommandAgent::new(config.agent.command.clone());
    let prompt = PromptBuilder::load(root, config.prompt_path.as_ref())?;
    let kill_switch = AnyKillSwitch::from_config(&config.kill_switch, root);

    let mut reporter = MultiReporter::new().with(JsonlReporter::new(&paths.events_path));
    if let Some(hook) = &config.report.hook {
        reporter = reporter.with(HookReporter::new(
            hook.clone(),
            root,
            Duration::from_secs(config.report.hook_timeout_secs),
        ));
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(err = %err, "could not install interrupt handler");
    }

    let outcome = run_loop(&LoopContext {
        config: &config,
        paths: &paths,
        gate: &gate,
        agent: &agent,
        workspace: &workspace,
        reporter: &reporter,
        kill_switch: &kill_switch,
        prompt: &prompt,
        interrupted: interrupted.as_ref(),
        deadline,
    })?;

    println!(
        "{} after {} iteration(s) (total cost ${})",
        outcome.stop.detail(),
        outcome.state.iteration,
        outcome.state.total_cost
    );
    Ok(outcome.exit_code())
}

fn cmd_status(root: &Path, selector: &LoopSelector) -> Result<i32> {
    let config = load_effective_config(root, selector)?;
    let paths = LoopPaths::new(root, &config.loop_id);
    let state = load_state(&paths.state_path, &config.loop_id, config.mode)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(exit_codes::OK)
}

fn cmd_reset(root: &Path, selector: &LoopSelector) -> Result<i32> {
    let config = load_effective_config(root, selector)?;
    let paths = LoopPaths::new(root, &config.loop_id);
    remove_if_exists(&paths.state_path)?;
    println!("reset loop '{}'", config.loop_id);
    Ok(exit_codes::OK)
}

fn cmd_check(root: &Path, selector: &LoopSelector) -> Result<i32> {
    let config = load_effective_config(root, selector)?;
    let result = build_gate(root, &config, None).run()?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.all_pass {
        exit_codes::OK
    } else {
        exit_codes::CIRCUIT_BREAKER
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["loopguard", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_overrides() {
        let cli = Cli::parse_from([
            "loopguard",
            "-vv",
            "run",
            "--max-iterations",
            "3",
            "--budget-max-usd",
            "10.5",
            "--mode",
            "polish",
            "--loop-id",
            "nightly",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.max_iterations, Some(3));
        assert_eq!(args.budget_max_usd, Usd::parse("10.5"));
        assert_eq!(args.selector.mode, Some(LoopMode::Polish));
        assert_eq!(args.selector.loop_id.as_deref(), Some("nightly"));
    }

    #[test]
    fn rejects_bad_budget() {
        assert!(Cli::try_parse_from(["loopguard", "run", "--budget-max-usd", "-1"]).is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = load_effective_config(
            temp.path(),
            &LoopSelector {
                loop_id: Some("alpha".to_string()),
                mode: Some(LoopMode::Polish),
            },
        )
        .expect("config");
        assert_eq!(config.loop_id, "alpha");
        assert_eq!(config.mode, LoopMode::Polish);

        let bad = LoopSelector {
            loop_id: Some("../escape".to_string()),
            mode: None,
        };
        assert!(load_effective_config(temp.path(), &bad).is_err());
    }
}
