// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot sets.
//!
//! A __set__ is an immutable, named collection of snapshots. Each snapshot is
//! the recorded derivation result for exactly one source commit, and is
//! addressed by that source commit's identifier.
//!
//! # Set Repositories
//!
//! Every set is a bare repository. Each snapshot is one commit whose tree is
//! the complete derived output, tagged with the source commit identifier, and
//! annotated with a note holding [`SnapshotNote`] as JSON. Invalid snapshots,
//! i.e., derivations that failed, are commits with an empty tree and a note
//! marking them invalid. Thus, asking whether a set holds a commit is just a
//! tag lookup, no content needs to be inspected.
//!
//! Sets are only ever written once. New snapshots are accumulated in a
//! [`WorkTree`], which gets finalized into a fresh set. A finalized set never
//! changes again, so any number of readers can use it at the same time.
//!
//! # See Also
//!
//! 1. [`worktree`]
//! 2. [`remote`]

pub mod remote;
pub mod worktree;

pub use remote::{FolderSetCollection, RemoteSet, SetCollection};
pub use worktree::WorkTree;

use crate::{
    backend::{Backend, BackendError, Git2Backend},
    derive::Notes,
    path::{clear_directory, ensure_dir},
};

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Metadata attached to every snapshot.
#[derive(Default, Debug, PartialEq, Clone, Deserialize, Serialize)]
pub struct SnapshotNote {
    /// Whether derivation succeeded.
    pub valid: bool,

    /// Custom notes produced by the derivation callback.
    #[serde(default)]
    pub data: Notes,
}

/// Derivation result recorded for one source commit.
#[derive(Debug, PartialEq, Clone)]
pub struct Snapshot {
    /// Source commit identifier the snapshot was derived from.
    pub commit_id: String,

    /// Whether derivation succeeded.
    pub valid: bool,

    /// Custom notes produced by the derivation callback.
    pub notes: Notes,
}

/// Queryable collection of snapshots held in one repository.
///
/// Implementors only need to say where their repository lives, and which
/// backend reads it. Lookup and extraction come for free.
pub trait SnapshotSet<B = Git2Backend>
where
    B: Backend,
{
    /// Location of the set's repository.
    fn location(&self) -> &Path;

    /// Backend used to read the set's repository.
    fn backend(&self) -> &B;

    /// Name of the set within its containing collection.
    fn name(&self) -> String {
        self.location()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Check if set holds a snapshot for source commit.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Backend`] if tags cannot be listed.
    fn has_commit(&self, id: &str) -> Result<bool> {
        Ok(self.backend().has_tag(self.location(), id)?)
    }

    /// List identifiers of every source commit the set holds a snapshot for.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Backend`] if tags cannot be listed.
    fn commit_ids(&self) -> Result<Vec<String>> {
        Ok(self.backend().list_tags(self.location())?)
    }

    /// Commit the set's default branch points at.
    ///
    /// Two sets with the same tip hold the exact same snapshots.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Backend`] if HEAD cannot be read.
    fn tip(&self) -> Result<Option<String>> {
        Ok(self.backend().head_commit(self.location())?)
    }

    /// Read snapshot recorded for source commit.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::CommitNotFound`] if set has no such snapshot.
    /// - Return [`SetError::MissingMetadata`] if snapshot carries no note.
    /// - Return [`SetError::Metadata`] if note is not a valid snapshot note.
    fn snapshot(&self, id: &str) -> Result<Snapshot> {
        let commit = self.resolve(id)?;
        let value = self
            .backend()
            .read_metadata(self.location(), &commit)?
            .ok_or_else(|| SetError::MissingMetadata { id: id.to_owned() })?;
        let note: SnapshotNote = serde_json::from_value(value)?;

        Ok(Snapshot {
            commit_id: id.to_owned(),
            valid: note.valid,
            notes: note.data,
        })
    }

    /// Extract snapshot content of source commit into target directory.
    ///
    /// Target directory is created if missing, and cleared entirely before
    /// extraction. Snapshots of failed derivations extract to nothing.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::CommitNotFound`] if set has no such snapshot.
    /// - Return [`SetError::Path`] if target directory cannot be prepared.
    /// - Return [`SetError::Backend`] if content cannot be extracted.
    fn checkout(&self, id: &str, target: &Path) -> Result<()> {
        let commit = self.resolve(id)?;
        ensure_dir(target)?;
        clear_directory(target, &[])?;
        debug!("extract {commit} of {:?} into {:?}", self.name(), target.display());
        self.backend()
            .extract_tree(self.location(), &commit, target)?;

        Ok(())
    }

    #[doc(hidden)]
    fn resolve(&self, id: &str) -> Result<String> {
        self.backend()
            .resolve_tag(self.location(), id)?
            .ok_or_else(|| SetError::CommitNotFound {
                id: id.to_owned(),
                set: self.name(),
            })
    }
}

/// Set held in the local store.
#[derive(Debug, Clone)]
pub struct LocalSet<B = Git2Backend>
where
    B: Backend,
{
    path: PathBuf,
    backend: B,
}

impl<B> LocalSet<B>
where
    B: Backend,
{
    /// Open existing set at target path.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::NotASet`] if path does not hold a repository.
    pub fn open(path: impl Into<PathBuf>, backend: B) -> Result<Self> {
        let path = path.into();
        if !backend.is_repository(&path) {
            return Err(SetError::NotASet { path });
        }

        Ok(Self { path, backend })
    }
}

impl<B> SnapshotSet<B> for LocalSet<B>
where
    B: Backend,
{
    fn location(&self) -> &Path {
        &self.path
    }

    fn backend(&self) -> &B {
        &self.backend
    }
}

/// Pick first name not taken according to `taken`.
///
/// Tries `base` itself, then `base-2`, `base-3`, and so on.
pub(crate) fn available_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_owned();
    }

    (2..)
        .map(|suffix| format!("{base}-{suffix}"))
        .find(|name| !taken(name))
        .unwrap_or_else(|| base.to_owned())
}

/// Scan directory for set repositories, sorted by name.
///
/// Hidden entries, plain files, and directories that are not repositories are
/// skipped and logged. A missing directory holds no sets.
pub(crate) fn scan_set_dirs<B: Backend>(dir: &Path, backend: &B) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        warn!("set directory {:?} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|err| SetError::Scan {
        source: err,
        path: dir.to_path_buf(),
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skip unreadable entry in {:?}: {err}", dir.display());
                continue;
            }
        };

        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            debug!("skip hidden entry {:?}", path.display());
        } else if !path.is_dir() {
            warn!("skip {:?}: not a directory", path.display());
        } else if !backend.is_repository(&path) {
            warn!("skip {:?}: not a set repository", path.display());
        } else {
            paths.push(path);
        }
    }
    paths.sort();

    Ok(paths)
}

/// Clone repository into destination so that it appears all at once.
///
/// The clone is staged at a hidden sibling path and renamed into place, so an
/// interruption never leaves a partial repository at destination.
///
/// # Errors
///
/// - Return [`SetError::DestinationExists`] if destination is non-empty.
#[instrument(skip(backend), level = "debug")]
pub(crate) fn clone_into_place<B: Backend>(
    backend: &B,
    source: &Path,
    destination: &Path,
    bare: bool,
) -> Result<()> {
    if destination.exists() && !is_empty_dir(destination) {
        return Err(SetError::DestinationExists {
            path: destination.to_path_buf(),
        });
    }

    let parent = destination
        .parent()
        .ok_or_else(|| SetError::DestinationExists {
            path: destination.to_path_buf(),
        })?;
    ensure_dir(parent)?;

    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{name}.partial"));
    let io_err = |err, path: &Path| SetError::Io {
        source: err,
        path: path.to_path_buf(),
    };

    // INVARIANT: Leftovers of an interrupted clone are garbage.
    if staging.exists() {
        warn!("remove stale staging directory {:?}", staging.display());
        fs::remove_dir_all(&staging).map_err(|err| io_err(err, &staging))?;
    }

    if let Err(err) = backend.clone_repository(&source.to_string_lossy(), &staging, bare) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err.into());
    }

    if destination.exists() {
        fs::remove_dir(destination).map_err(|err| io_err(err, destination))?;
    }
    fs::rename(&staging, destination).map_err(|err| io_err(err, destination))?;

    Ok(())
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Set error types.
#[derive(Debug, thiserror::Error)]
pub enum SetError {
    /// Destination already holds something.
    #[error("destination {:?} exists already", path.display())]
    DestinationExists { path: PathBuf },

    /// Set holds no snapshot for source commit.
    #[error("set {set:?} holds no snapshot of commit {id}")]
    CommitNotFound { id: String, set: String },

    /// Path does not hold a set repository.
    #[error("{:?} does not hold a set", path.display())]
    NotASet { path: PathBuf },

    /// Snapshot carries no metadata.
    #[error("snapshot of commit {id} has no metadata")]
    MissingMetadata { id: String },

    /// Remote collection does not accept uploads.
    #[error("set collection {identifier:?} is readonly")]
    ReadonlyCollection { identifier: String },

    /// Directory holding sets cannot be scanned.
    #[error("failed to scan sets in {:?}", path.display())]
    Scan {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// File system operation fails.
    #[error("file system operation failed at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Snapshot note is malformed.
    #[error(transparent)]
    Metadata(#[from] serde_json::Error),

    /// Directory utility fails.
    #[error(transparent)]
    Path(#[from] crate::path::Error),

    /// Backend operation fails.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Friendly result alias :3
pub type Result<T, E = SetError> = std::result::Result<T, E>;
