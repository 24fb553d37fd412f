// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local store management.
//!
//! Derivedrepo keeps everything it produces on one machine in one place
//! called the __local store__. The local store houses every finalized set,
//! the work trees of runs in progress, and the store's configuration.
//!
//! # Local Store Layout
//!
//! The local store can be placed anywhere on the user's file system. By
//! default it is the current directory, with `$XDG_DATA_HOME/derivedrepo-store`
//! as the fallback for library users. Its top-level looks like so:
//!
//! ```text
//! <store>/
//! ├── config.json
//! ├── sets/
//! │   ├── nightly/
//! │   └── release/
//! ├── worktrees/
//! └── checkout/
//! ```
//!
//! The name of a set is the name of its directory under "sets". Only the
//! top-level of "sets" is evaluated. A set directory appears atomically once
//! its run completes, so a crash mid-run leaves only a stale entry under
//! "worktrees" behind, which the next run with the same name discards.

use crate::{
    backend::{Backend, Git2Backend},
    config::CONFIG_FILE,
    path::ensure_dir,
    set::{scan_set_dirs, LocalSet, SetError, SnapshotSet, WorkTree},
};

use std::{
    fs,
    path::{Component, Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Directory holding finalized sets.
pub const SETS_DIR: &str = "sets";

/// Directory holding work trees of runs in progress.
pub const WORKTREES_DIR: &str = "worktrees";

/// Default directory snapshots get checked out into.
pub const CHECKOUT_DIR: &str = "checkout";

/// Local store of sets.
#[derive(Debug, Clone)]
pub struct LocalStore<B = Git2Backend>
where
    B: Backend,
{
    root: PathBuf,
    backend: B,
}

impl<B> LocalStore<B>
where
    B: Backend,
{
    /// Open local store at target path, creating its layout if missing.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Path`] if store directories cannot be created.
    #[instrument(skip(root, backend), level = "debug")]
    pub fn open(root: impl Into<PathBuf>, backend: B) -> Result<Self> {
        let store = Self {
            root: root.into(),
            backend,
        };
        ensure_dir(store.sets_dir())?;
        ensure_dir(store.worktrees_dir())?;

        Ok(store)
    }

    /// Top-level directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backend used for every set in the store.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn sets_dir(&self) -> PathBuf {
        self.root.join(SETS_DIR)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join(WORKTREES_DIR)
    }

    pub fn default_checkout_dir(&self) -> PathBuf {
        self.root.join(CHECKOUT_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Location a set of target name lives at.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSetName`] if name is not a plain
    ///   directory name, or is hidden.
    pub fn set_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.sets_dir().join(name))
    }

    /// Location the work tree for a set of target name lives at.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSetName`] if name is not a plain
    ///   directory name, or is hidden.
    pub fn worktree_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.worktrees_dir().join(name))
    }

    /// Check if store holds a set of target name.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSetName`] if name is invalid.
    pub fn has_set(&self, name: &str) -> Result<bool> {
        Ok(self.set_path(name)?.exists())
    }

    /// Open set of target name if the store holds it.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSetName`] if name is invalid.
    /// - Return [`StoreError::Set`] if entry exists but is not a set.
    pub fn set(&self, name: &str) -> Result<Option<LocalSet<B>>> {
        let path = self.set_path(name)?;
        if !path.exists() {
            return Ok(None);
        }

        Ok(Some(LocalSet::open(path, self.backend.clone())?))
    }

    /// List every set in the store, sorted by name.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Set`] if sets directory cannot be scanned.
    pub fn sets(&self) -> Result<Vec<LocalSet<B>>> {
        scan_set_dirs(&self.sets_dir(), &self.backend)?
            .into_iter()
            .map(|path| LocalSet::open(path, self.backend.clone()).map_err(StoreError::from))
            .collect()
    }

    /// List sets holding a snapshot of target source commit, sorted by name.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Set`] if any set cannot be queried.
    pub fn sets_with_commit(&self, id: &str) -> Result<Vec<LocalSet<B>>> {
        let mut matches = Vec::new();
        for set in self.sets()? {
            if set.has_commit(id)? {
                matches.push(set);
            }
        }

        Ok(matches)
    }

    /// Delete set of target name.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::SetNotFound`] if store has no such set.
    /// - Return [`StoreError::Io`] if set cannot be removed.
    #[instrument(skip(self), level = "debug")]
    pub fn remove_set(&self, name: &str) -> Result<()> {
        let path = self.set_path(name)?;
        if !path.exists() {
            return Err(StoreError::SetNotFound {
                name: name.to_owned(),
            });
        }

        fs::remove_dir_all(&path).map_err(|err| StoreError::Io { source: err, path })?;
        info!("removed set {name:?}");

        Ok(())
    }

    /// Create fresh work tree for a set of target name.
    ///
    /// A work tree left over from an interrupted run is discarded first.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSetName`] if name is invalid.
    /// - Return [`StoreError::Io`] if stale work tree cannot be removed.
    /// - Return [`StoreError::Set`] if work tree cannot be created.
    pub fn new_worktree(&self, name: &str) -> Result<WorkTree<B>> {
        let path = self.worktree_path(name)?;
        self.discard_stale(&path)?;

        Ok(WorkTree::create(path, self.backend.clone())?)
    }

    /// Create work tree for a set of target name holding all of `base`.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::InvalidSetName`] if name is invalid.
    /// - Return [`StoreError::Io`] if stale work tree cannot be removed.
    /// - Return [`StoreError::Set`] if base cannot be cloned.
    pub fn new_worktree_from(&self, name: &str, base: &LocalSet<B>) -> Result<WorkTree<B>> {
        let path = self.worktree_path(name)?;
        self.discard_stale(&path)?;

        Ok(WorkTree::seeded_from(path, base, self.backend.clone())?)
    }

    /// Remove every work tree left over from interrupted runs.
    ///
    /// Returns names of removed work trees.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Io`] if any work tree cannot be removed.
    #[instrument(skip(self), level = "debug")]
    pub fn prune_worktrees(&self) -> Result<Vec<String>> {
        let dir = self.worktrees_dir();
        let entries = fs::read_dir(&dir).map_err(|err| StoreError::Io {
            source: err,
            path: dir.clone(),
        })?;

        let mut pruned = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::Io {
                source: err,
                path: dir.clone(),
            })?;
            let path = entry.path();
            remove_entry(&path)?;
            info!("pruned stale work tree {:?}", path.display());
            pruned.push(entry.file_name().to_string_lossy().into_owned());
        }
        pruned.sort();

        Ok(pruned)
    }

    fn discard_stale(&self, path: &Path) -> Result<()> {
        if path.exists() {
            warn!("discard stale work tree {:?}", path.display());
            remove_entry(path)?;
        }

        Ok(())
    }
}

fn remove_entry(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|err| StoreError::Io {
        source: err,
        path: path.to_path_buf(),
    })
}

fn validate_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    let valid = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.starts_with('.');

    if !valid {
        return Err(StoreError::InvalidSetName {
            name: name.to_owned(),
        });
    }

    Ok(())
}

/// All possible error types for local store interaction.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Name cannot be used for a set.
    #[error("invalid set name {name:?}")]
    InvalidSetName { name: String },

    /// Store holds no set of target name.
    #[error("no set named {name:?} in local store")]
    SetNotFound { name: String },

    /// File system operation fails.
    #[error("file system operation failed at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory utility fails.
    #[error(transparent)]
    Path(#[from] crate::path::Error),

    /// Set operation fails.
    #[error(transparent)]
    Set(#[from] SetError),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use tempfile::TempDir;

    #[test_case("nightly", true; "plain name")]
    #[test_case("release-1.2", true; "dotted name")]
    #[test_case("", false; "empty")]
    #[test_case(".hidden", false; "hidden")]
    #[test_case("..", false; "parent")]
    #[test_case("a/b", false; "nested")]
    #[test_case("/abs", false; "absolute")]
    #[test]
    fn validates_set_names(name: &str, expect: bool) {
        assert_eq!(validate_name(name).is_ok(), expect);
    }

    #[test]
    fn open_creates_layout() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let store = LocalStore::open(root.path().join("store"), Git2Backend::new())?;

        assert!(store.sets_dir().is_dir());
        assert!(store.worktrees_dir().is_dir());
        assert!(store.sets()?.is_empty());
        assert!(store.set("nightly")?.is_none());

        Ok(())
    }

    #[test]
    fn stale_worktree_is_replaced() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let store = LocalStore::open(root.path(), Git2Backend::new())?;
        let stale = store.worktree_path("nightly")?;
        fs::create_dir_all(&stale)?;
        fs::write(stale.join("garbage"), "")?;

        let worktree = store.new_worktree("nightly")?;
        assert!(worktree.is_empty());
        assert!(!stale.join("garbage").exists());

        Ok(())
    }

    #[test]
    fn prune_removes_every_worktree() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let store = LocalStore::open(root.path(), Git2Backend::new())?;
        fs::create_dir_all(store.worktree_path("b")?)?;
        fs::create_dir_all(store.worktree_path("a")?)?;

        assert_eq!(store.prune_worktrees()?, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fs::read_dir(store.worktrees_dir())?.count(), 0);

        Ok(())
    }

    #[test]
    fn remove_missing_set_fails() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let store = LocalStore::open(root.path(), Git2Backend::new())?;

        let result = store.remove_set("nightly");
        assert!(matches!(result, Err(StoreError::SetNotFound { .. })));

        Ok(())
    }
}
