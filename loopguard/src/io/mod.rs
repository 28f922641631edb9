//! I/O adapters for the control loop.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod agent;
pub mod checks;
pub mod config;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod kill_switch;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod report;
pub mod state;

/// Write `contents` to `<path>.tmp`, then rename over `path`.
///
/// Readers see either the previous file or the complete new one, never a
/// partial write.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
