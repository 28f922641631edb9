//! Canonical paths under `.loopguard/` and workspace scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::io::config::{CONFIG_FILE, LoopConfig, write_config};

/// Runtime directory, relative to the workspace root. Never counted as progress.
pub const RUNTIME_DIR: &str = ".loopguard";

const RUNTIME_GITIGNORE: &str = "*\n";

/// All paths owned by one loop. Every path is derived from the loop id so
/// concurrently running loops never share state, logs, or event streams.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub loop_dir: PathBuf,
    pub state_path: PathBuf,
    pub events_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>, loop_id: &str) -> Self {
        let root = root.into();
        let runtime_dir = root.join(RUNTIME_DIR);
        let loop_dir = runtime_dir.join(loop_id);
        Self {
            config_path: root.join(CONFIG_FILE),
            gitignore_path: runtime_dir.join(".gitignore"),
            state_path: loop_dir.join("state.json"),
            events_path: loop_dir.join("events.jsonl"),
            iterations_dir: loop_dir.join("iterations"),
            runtime_dir,
            loop_dir,
            root,
        }
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(iteration.to_string())
    }
}

/// Validate that a loop id is safe to use as a directory name.
pub fn validate_loop_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing `loopguard.toml`.
    pub force: bool,
}

/// Write default `loopguard.toml` and the ignored runtime directory.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<LoopPaths> {
    let config = LoopConfig::default();
    let paths = LoopPaths::new(root, &config.loop_id);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "loopguard init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    fs::create_dir_all(&paths.runtime_dir)
        .with_context(|| format!("create directory {}", paths.runtime_dir.display()))?;
    ensure_runtime_gitignore(&paths)?;
    write_config(&paths.config_path, &config)?;
    debug!(config = %paths.config_path.display(), "workspace initialized");
    Ok(paths)
}

/// Keep `.loopguard/` out of version control so loop bookkeeping never shows
/// up as workspace changes.
pub fn ensure_runtime_gitignore(paths: &LoopPaths) -> Result<()> {
    if paths.gitignore_path.exists() {
        return Ok(());
    }
    fs::create_dir_all(&paths.runtime_dir)
        .with_context(|| format!("create directory {}", paths.runtime_dir.display()))?;
    fs::write(&paths.gitignore_path, RUNTIME_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn paths_are_scoped_by_loop_id() {
        let a = LoopPaths::new("/ws", "alpha");
        let b = LoopPaths::new("/ws", "beta");
        assert!(a.state_path.ends_with(".loopguard/alpha/state.json"));
        assert!(b.events_path.ends_with(".loopguard/beta/events.jsonl"));
        assert_ne!(a.iterations_dir, b.iterations_dir);
        assert_eq!(a.config_path, b.config_path);
        assert!(a.iteration_dir(7).ends_with("alpha/iterations/7"));
    }

    #[test]
    fn rejects_unsafe_ids() {
        assert!(validate_loop_id("nightly-2").is_ok());
        assert!(validate_loop_id("").is_err());
        assert!(validate_loop_id("..").is_err());
        assert!(validate_loop_id("a/b").is_err());
        assert!(validate_loop_id("a b").is_err());
    }

    #[test]
    fn init_writes_config_and_gitignore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            RUNTIME_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("load"),
            LoopConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workspace(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        init_workspace(temp.path(), &InitOptions { force: true }).expect("re-init");
    }
}
