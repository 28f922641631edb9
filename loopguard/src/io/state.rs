//! Loop state storage for iteration bookkeeping.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{LoopMode, LoopState};

/// A state file exists but cannot be parsed.
#[derive(Debug, Error)]
#[error("corrupt loop state {}: {source}", .path.display())]
pub struct CorruptStateError {
    pub path: PathBuf,
    #[source]
    pub source: serde_json::Error,
}

/// Load loop state from disk.
///
/// A missing file yields the zero-state for `loop_id`/`mode`. A present but
/// unparseable file fails with [`CorruptStateError`].
pub fn load_state(path: &Path, loop_id: &str, mode: LoopMode) -> Result<LoopState> {
    debug!(path = %path.display(), "loading loop state");
    if !path.exists() {
        debug!("no loop state, starting from zero");
        return Ok(LoopState::new(loop_id, mode));
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read loop state {}", path.display()))?;
    let mut state: LoopState =
        serde_json::from_str(&contents).map_err(|source| CorruptStateError {
            path: path.to_path_buf(),
            source,
        })?;
    if state.loop_id != loop_id || state.mode != mode {
        debug!(
            from_id = %state.loop_id,
            from_mode = state.mode.as_str(),
            "rebasing loop state onto current id/mode"
        );
        state.loop_id = loop_id.to_string();
        state.mode = mode;
    }
    debug!(
        iteration = state.iteration,
        total_cost = %state.total_cost,
        "loop state loaded"
    );
    Ok(state)
}

/// Load state, resetting to zero-state on corruption instead of failing.
///
/// The unreadable file is kept next to the canonical one as `*.corrupt`.
pub fn load_or_reset(path: &Path, loop_id: &str, mode: LoopMode) -> Result<LoopState> {
    match load_state(path, loop_id, mode) {
        Ok(state) => Ok(state),
        Err(err) => {
            let Some(corrupt) = err.downcast_ref::<CorruptStateError>() else {
                return Err(err);
            };
            let backup = path.with_extension("json.corrupt");
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                err = %corrupt,
                "loop state is corrupt, resetting to zero-state"
            );
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(err = %rename_err, "could not preserve corrupt loop state");
            }
            Ok(LoopState::new(loop_id, mode))
        }
    }
}

/// Atomically write loop state to disk (temp file + rename).
pub fn save_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(
        path = %path.display(),
        iteration = state.iteration,
        total_cost = %state.total_cost,
        "writing loop state"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}

/// Best-effort save for abnormal exit paths; failures are only logged.
pub fn save_state_quietly(path: &Path, state: &LoopState) {
    if let Err(err) = save_state(path, state) {
        warn!(path = %path.display(), err = %err, "final loop state save failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cost::Usd;

    fn populated() -> LoopState {
        LoopState {
            loop_id: "nightly".to_string(),
            mode: LoopMode::Polish,
            iteration: 5,
            total_cost: Usd::parse("3.25").expect("usd"),
            no_progress_count: 1,
            last_error_signature: "test".to_string(),
            same_error_count: 2,
            last_revision: Some("abc123".to_string()),
        }
    }

    /// Verifies write → read preserves all fields.
    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let state = populated();

        save_state(&path, &state).expect("write");
        let loaded = load_state(&path, "nightly", LoopMode::Polish).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_is_zero_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded =
            load_state(&temp.path().join("nope.json"), "x", LoopMode::Build).expect("load");
        assert_eq!(loaded, LoopState::new("x", LoopMode::Build));
    }

    /// Ensures the zero-state serializes to a known, stable JSON format.
    #[test]
    fn zero_state_format_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        save_state(&path, &LoopState::default()).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        let expected = "{\n  \"loop_id\": \"default\",\n  \"mode\": \"build\",\n  \"iteration\": 0,\n  \"total_cost\": \"0\",\n  \"no_progress_count\": 0,\n  \"last_error_signature\": \"\",\n  \"same_error_count\": 0,\n  \"last_revision\": null\n}\n";
        assert_eq!(contents, expected);
    }

    #[test]
    fn corrupt_file_is_a_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_state(&path, "default", LoopMode::Build).unwrap_err();
        assert!(err.downcast_ref::<CorruptStateError>().is_some());
    }

    #[test]
    fn load_or_reset_recovers_and_keeps_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "garbage").expect("write");
        let state = load_or_reset(&path, "default", LoopMode::Build).expect("reset");
        assert_eq!(state, LoopState::default());
        assert!(temp.path().join("state.json.corrupt").is_file());
        assert!(!path.exists());
    }

    /// A crash between temp-write and rename leaves the prior state readable.
    #[test]
    fn stale_temp_file_does_not_affect_reads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let state = populated();
        save_state(&path, &state).expect("write");
        fs::write(path.with_extension("json.tmp"), "{ half writ").expect("write tmp");

        let loaded = load_state(&path, "nightly", LoopMode::Polish).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn state_from_other_mode_is_rebased() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        save_state(&path, &populated()).expect("write");
        let loaded = load_state(&path, "nightly", LoopMode::Build).expect("load");
        assert_eq!(loaded.mode, LoopMode::Build);
        assert_eq!(loaded.iteration, 5);
    }
}
