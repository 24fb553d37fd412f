// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mutable staging area for new sets.
//!
//! A __work tree__ is a regular repository with a working tree that exists for
//! the duration of one derivation run. Each processed source commit becomes
//! one snapshot commit in it. Once every commit is processed, the work tree is
//! finalized into a bare set repository and removed.

use crate::{
    backend::{Backend, Git2Backend, Identity, Timestamp},
    path::{clear_directory, copy_dir_content},
    set::{clone_into_place, LocalSet, Result, SetError, SnapshotNote, SnapshotSet},
};

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Staging repository accumulating snapshots before becoming a set.
///
/// # Invariant
///
/// - Every tag is used at most once.
/// - Each snapshot replaces the entire content of the previous one.
#[derive(Debug)]
pub struct WorkTree<B = Git2Backend>
where
    B: Backend,
{
    path: PathBuf,
    backend: B,
    tags: HashSet<String>,
}

impl<B> WorkTree<B>
where
    B: Backend,
{
    /// Create new empty work tree at target path.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::DestinationExists`] if path exists already.
    /// - Return [`SetError::Backend`] if repository cannot be initialized.
    #[instrument(skip(path, backend), level = "debug")]
    pub fn create(path: impl Into<PathBuf>, backend: B) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(SetError::DestinationExists { path });
        }

        debug!("create work tree at {:?}", path.display());
        backend.init_repository(&path)?;

        Ok(Self {
            path,
            backend,
            tags: HashSet::new(),
        })
    }

    /// Create new work tree holding every snapshot of an existing set.
    ///
    /// Snapshots committed afterwards are appended after those of `base`.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::DestinationExists`] if path exists already.
    /// - Return [`SetError::Backend`] if base cannot be cloned.
    #[instrument(skip(path, base, backend), level = "debug")]
    pub fn seeded_from(
        path: impl Into<PathBuf>,
        base: &impl SnapshotSet<B>,
        backend: B,
    ) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            return Err(SetError::DestinationExists { path });
        }

        debug!("seed work tree at {:?} from {:?}", path.display(), base.name());
        backend.clone_repository(&base.location().to_string_lossy(), &path, false)?;
        let tags = backend.list_tags(&path)?.into_iter().collect();

        Ok(Self {
            path,
            backend,
            tags,
        })
    }

    /// Location of the work tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a snapshot is already tagged with target label.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Number of snapshots held.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Check if no snapshot has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Commit one snapshot.
    ///
    /// Clears all tracked content, copies `content` in if given, and commits
    /// the result tagged with `tag` and annotated with `note`. Passing no
    /// content records an empty snapshot, which still marks `tag` as taken.
    ///
    /// # Panics
    ///
    /// - Panics if `tag` was already used in this work tree. Callers must
    ///   check [`WorkTree::has_tag`] first.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Path`] if staged content cannot be replaced.
    /// - Return [`SetError::Backend`] if commit, tag, or note fails.
    #[instrument(skip(self, content, message, author, time, note), level = "debug")]
    pub fn commit_snapshot(
        &mut self,
        content: Option<&Path>,
        message: &str,
        author: &Identity,
        time: Timestamp,
        tag: &str,
        note: &SnapshotNote,
    ) -> Result<String> {
        assert!(
            !self.tags.contains(tag),
            "tag {tag:?} used twice in work tree {:?}",
            self.path.display()
        );

        // INVARIANT: Snapshots replace content, they never merge with it.
        clear_directory(&self.path, &[".git"])?;
        if let Some(content) = content {
            copy_dir_content(content, &self.path)?;
        }

        let commit = self
            .backend
            .commit_working_tree(&self.path, message, author, time)?;
        self.backend.tag(&self.path, &commit, tag)?;
        self.backend
            .attach_metadata(&self.path, &commit, &serde_json::to_value(note)?)?;
        self.tags.insert(tag.to_owned());
        debug!("snapshot {commit} tagged {tag}, valid: {}", note.valid);

        Ok(commit)
    }

    /// Finalize work tree into an immutable set at destination.
    ///
    /// The set appears at destination all at once. The work tree is removed
    /// afterwards.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::DestinationExists`] if destination already holds
    ///   something. The work tree is left untouched on disk.
    /// - Return [`SetError::Backend`] if work tree cannot be cloned.
    #[instrument(skip(self, destination), level = "debug")]
    pub fn finalize(self, destination: impl AsRef<Path>) -> Result<LocalSet<B>> {
        let destination = destination.as_ref();
        clone_into_place(&self.backend, &self.path, destination, true)?;
        info!(
            "finalized {} snapshots into {:?}",
            self.tags.len(),
            destination.display()
        );

        let set = LocalSet::open(destination, self.backend.clone())?;
        self.discard()?;

        Ok(set)
    }

    /// Throw work tree away without producing a set.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Io`] if work tree cannot be removed.
    pub fn discard(self) -> Result<()> {
        debug!("discard work tree {:?}", self.path.display());
        fs::remove_dir_all(&self.path).map_err(|err| SetError::Io {
            source: err,
            path: self.path.clone(),
        })
    }
}
