//! External kill switch polled at the top of every iteration.

use std::env;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::io::config::KillSwitchConfig;

/// Reports whether the loop may keep running.
pub trait KillSwitch {
    fn is_enabled(&self) -> bool;
}

impl<F: Fn() -> bool> KillSwitch for F {
    fn is_enabled(&self) -> bool {
        self()
    }
}

/// `false`/`0` (case-insensitive, surrounding whitespace ignored) disable;
/// anything else enables.
pub fn parse_enabled(raw: &str) -> bool {
    let value = raw.trim();
    !(value == "0" || value.eq_ignore_ascii_case("false"))
}

/// Polls an environment variable. An unset variable means enabled.
#[derive(Debug, Clone)]
pub struct EnvKillSwitch {
    var: String,
}

impl EnvKillSwitch {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl KillSwitch for EnvKillSwitch {
    fn is_enabled(&self) -> bool {
        match env::var(&self.var) {
            Ok(value) => {
                let enabled = parse_enabled(&value);
                debug!(var = %self.var, value = %value, enabled, "kill switch env");
                enabled
            }
            Err(_) => true,
        }
    }
}

/// Polls a file's contents. A missing file means enabled.
#[derive(Debug, Clone)]
pub struct FileKillSwitch {
    path: PathBuf,
}

impl FileKillSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KillSwitch for FileKillSwitch {
    fn is_enabled(&self) -> bool {
        if !self.path.exists() {
            return true;
        }
        match fs::read_to_string(&self.path) {
            Ok(contents) => parse_enabled(&contents),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable kill switch file, keeping loop enabled");
                true
            }
        }
    }
}

/// Disabled as soon as any member says so.
pub struct AnyKillSwitch {
    switches: Vec<Box<dyn KillSwitch>>,
}

impl AnyKillSwitch {
    pub fn from_config(config: &KillSwitchConfig, root: &std::path::Path) -> Self {
        let mut switches: Vec<Box<dyn KillSwitch>> =
            vec![Box::new(EnvKillSwitch::new(&config.env))];
        if let Some(file) = &config.file {
            switches.push(Box::new(FileKillSwitch::new(root.join(file))));
        }
        Self { switches }
    }
}

impl KillSwitch for AnyKillSwitch {
    fn is_enabled(&self) -> bool {
        self.switches.iter().all(|switch| switch.is_enabled())
    }
}
