//! Workspace progress measurement and iteration commits.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::CONFIG_FILE;
use crate::io::git::{Git, StatusEntry};
use crate::io::init::RUNTIME_DIR;

/// Recorded state of one uncommitted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPath {
    /// Regular file, stored as the blob with this id.
    Blob(String),
    /// Tracked path deleted in the working tree.
    Missing,
    /// Present but not a regular file (symlink, submodule). Never restored.
    Opaque,
}

/// Point-in-time token for the managed workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Content revision, if the workspace has one.
    pub revision: Option<String>,
    /// Uncommitted paths at snapshot time.
    pub pending: BTreeMap<String, PendingPath>,
}

/// Measures how much one iteration changed the workspace.
pub trait ProgressTracker {
    fn snapshot(&self) -> Result<Snapshot>;

    /// Number of distinct paths changed between `before` and `after`.
    fn changed_units(&self, before: &Snapshot, after: &Snapshot) -> Result<u32>;
}

/// Records and rolls back iteration changes.
pub trait Committer {
    /// Commit all pending changes; returns the new revision, or `None` when
    /// there was nothing to commit.
    fn commit_all(&self, message: &str) -> Result<Option<String>>;

    /// Undo everything done since `snapshot`. Uncommitted work recorded in the
    /// snapshot is put back; files created since are removed.
    fn revert_to(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Everything the control loop needs from the managed workspace.
pub trait Workspace: ProgressTracker + Committer {}

impl<T: ProgressTracker + Committer> Workspace for T {}

/// Git-backed workspace.
///
/// Paths under the loop's own runtime directory are never counted, and the
/// loop config is never removed by a revert.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    root: PathBuf,
    git: Git,
    excluded_prefixes: Vec<String>,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            git: Git::new(root.clone()),
            root,
            excluded_prefixes: vec![format!("{RUNTIME_DIR}/")],
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    fn counted(&self, path: &str) -> bool {
        !self
            .excluded_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn pending_entries(&self) -> Result<Vec<StatusEntry>> {
        Ok(self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| self.counted(&entry.path))
            .collect())
    }

    /// Delete a file created after the snapshot, then any directories it leaves empty.
    fn remove_created(&self, rel: &str) -> Result<()> {
        let path = self.root.join(rel);
        debug!(path = rel, "removing file created since snapshot");
        remove_if_present(&path)?;
        let mut dir = path.parent();
        while let Some(parent) = dir {
            if parent == self.root.as_path() || fs::remove_dir(parent).is_err() {
                break;
            }
            dir = parent.parent();
        }
        Ok(())
    }

    fn restore(&self, rel: &str, recorded: &PendingPath) -> Result<()> {
        let path = self.root.join(rel);
        match recorded {
            PendingPath::Blob(id) => {
                let contents = self.git.read_blob(id)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                fs::write(&path, contents).with_context(|| format!("restore {rel}"))
            }
            PendingPath::Missing => remove_if_present(&path),
            PendingPath::Opaque => Ok(()),
        }
    }
}

impl ProgressTracker for GitWorkspace {
    fn snapshot(&self) -> Result<Snapshot> {
        let revision = self.git.head_sha()?;
        let mut pending = BTreeMap::new();
        let mut files = Vec::new();
        for entry in self.pending_entries()? {
            match fs::symlink_metadata(self.root.join(&entry.path)) {
                Ok(meta) if meta.is_file() => files.push(entry.path),
                Ok(_) => {
                    pending.insert(entry.path, PendingPath::Opaque);
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    pending.insert(entry.path, PendingPath::Missing);
                }
                Err(err) => return Err(err).with_context(|| format!("stat {}", entry.path)),
            }
        }
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let ids = self.git.hash_objects(&refs)?;
        pending.extend(files.into_iter().zip(ids).map(|(path, id)| (path, PendingPath::Blob(id))));
        Ok(Snapshot { revision, pending })
    }

    /// Paths in the diff between the two revisions, plus uncommitted paths
    /// whose recorded contents differ between the snapshots. Edits that were
    /// already pending before and stayed untouched do not count.
    #[instrument(skip_all)]
    fn changed_units(&self, before: &Snapshot, after: &Snapshot) -> Result<u32> {
        let mut paths = BTreeSet::new();
        if let (Some(from), Some(to)) = (&before.revision, &after.revision)
            && from != to
        {
            paths.extend(
                self.git
                    .diff_name_only(from, to)?
                    .into_iter()
                    .filter(|path| self.counted(path)),
            );
        }
        for path in before.pending.keys().chain(after.pending.keys()) {
            if before.pending.get(path) != after.pending.get(path) {
                paths.insert(path.clone());
            }
        }
        let count = u32::try_from(paths.len()).unwrap_or(u32::MAX);
        debug!(count, "changed paths");
        Ok(count)
    }
}

impl Committer for GitWorkspace {
    fn commit_all(&self, message: &str) -> Result<Option<String>> {
        self.git.add_all()?;
        if !self.git.commit_staged(message)? {
            return Ok(None);
        }
        self.git.head_sha()
    }

    #[instrument(skip_all)]
    fn revert_to(&self, snapshot: &Snapshot) -> Result<()> {
        let revision = snapshot
            .revision
            .as_deref()
            .ok_or_else(|| anyhow!("cannot revert: snapshot has no revision"))?;
        self.git.reset_hard(revision)?;
        for entry in self.pending_entries()? {
            if entry.is_untracked()
                && entry.path != CONFIG_FILE
                && !snapshot.pending.contains_key(&entry.path)
            {
                self.remove_created(&entry.path)?;
            }
        }
        for (path, recorded) in &snapshot.pending {
            self.restore(path, recorded)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            Err(err).with_context(|| format!("remove {}", path.display()))
        }
        _ => Ok(()),
    }
}
