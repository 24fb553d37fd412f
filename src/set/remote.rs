// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote set collections.
//!
//! A __remote set collection__ is a location holding exported sets so they
//! can be shared across machines. Sets found in a collection can be queried
//! in place, and downloaded into the local store as independent copies.
//! Collections that are not readonly also accept uploads of local sets.
//!
//! The only collection kind provided is [`FolderSetCollection`], a directory
//! whose top-level entries are bare set repositories, e.g., a directory on a
//! network share.

use crate::{
    backend::{Backend, Git2Backend},
    path::ensure_dir,
    set::{
        available_name, clone_into_place, scan_set_dirs, LocalSet, Result, SetError, SnapshotSet,
    },
};

use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Set living in a remote collection.
#[derive(Debug, Clone)]
pub struct RemoteSet<B = Git2Backend>
where
    B: Backend,
{
    path: PathBuf,
    backend: B,
}

impl<B> RemoteSet<B>
where
    B: Backend,
{
    /// Open existing remote set at target path.
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

    /// Stable identifier of remote set.
    pub fn identifier(&self) -> String {
        self.path.display().to_string()
    }

    /// Download full independent copy of remote set into destination.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::DestinationExists`] if destination is non-empty.
    /// - Return [`SetError::Backend`] if remote set cannot be cloned.
    #[instrument(skip(self, destination), level = "debug")]
    pub fn download(&self, destination: impl AsRef<Path>) -> Result<LocalSet<B>> {
        let destination = destination.as_ref();
        info!(
            "download {:?} into {:?}",
            self.identifier(),
            destination.display()
        );
        clone_into_place(&self.backend, &self.path, destination, true)?;

        LocalSet::open(destination, self.backend.clone())
    }
}

impl<B> SnapshotSet<B> for RemoteSet<B>
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

/// Location holding zero or more shareable sets.
pub trait SetCollection<B = Git2Backend>
where
    B: Backend,
{
    /// Stable identifier of the collection.
    fn identifier(&self) -> String;

    /// Check if collection refuses uploads.
    fn is_readonly(&self) -> bool;

    /// List every set in the collection.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Scan`] if the collection cannot be enumerated.
    fn sets(&self) -> Result<Vec<RemoteSet<B>>>;

    /// Upload local set into the collection.
    ///
    /// Returns `None` if the collection already holds an identical set.
    /// Name conflicts with different sets never overwrite anything.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::ReadonlyCollection`] if collection is readonly.
    fn upload(&self, set: &LocalSet<B>) -> Result<Option<RemoteSet<B>>>;

    /// List sets that hold a snapshot of target source commit.
    ///
    /// # Errors
    ///
    /// - Return [`SetError::Scan`] if the collection cannot be enumerated.
    /// - Return [`SetError::Backend`] if any set cannot be queried.
    fn sets_with_commit(&self, id: &str) -> Result<Vec<RemoteSet<B>>> {
        let mut matches = Vec::new();
        for set in self.sets()? {
            if set.has_commit(id)? {
                matches.push(set);
            }
        }

        Ok(matches)
    }
}

/// Directory of bare set repositories.
#[derive(Debug, Clone)]
pub struct FolderSetCollection<B = Git2Backend>
where
    B: Backend,
{
    path: PathBuf,
    readonly: bool,
    backend: B,
}

impl<B> FolderSetCollection<B>
where
    B: Backend,
{
    /// Construct new folder collection.
    ///
    /// The directory does not need to exist until something is uploaded.
    pub fn new(path: impl Into<PathBuf>, readonly: bool, backend: B) -> Self {
        Self {
            path: path.into(),
            readonly,
            backend,
        }
    }

    /// Directory holding the collection's sets.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<B> SetCollection<B> for FolderSetCollection<B>
where
    B: Backend,
{
    fn identifier(&self) -> String {
        self.path.display().to_string()
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn sets(&self) -> Result<Vec<RemoteSet<B>>> {
        Ok(scan_set_dirs(&self.path, &self.backend)?
            .into_iter()
            .map(|path| RemoteSet {
                path,
                backend: self.backend.clone(),
            })
            .collect())
    }

    #[instrument(skip(self, set), level = "debug")]
    fn upload(&self, set: &LocalSet<B>) -> Result<Option<RemoteSet<B>>> {
        if self.readonly {
            return Err(SetError::ReadonlyCollection {
                identifier: self.identifier(),
            });
        }

        // INVARIANT: Same tip means same snapshots, so never upload twice.
        //   - Sets without snapshots have no tip, so match those by name.
        let tip = set.tip()?;
        for remote in self.sets()? {
            let present = match &tip {
                Some(_) => remote.tip()? == tip,
                None => remote.name() == set.name() && remote.tip()?.is_none(),
            };
            if present {
                info!(
                    "set {:?} already present in {:?} as {:?}",
                    set.name(),
                    self.identifier(),
                    remote.name()
                );
                return Ok(None);
            }
        }

        ensure_dir(&self.path)?;
        let name = available_name(&set.name(), |name| self.path.join(name).exists());
        let destination = self.path.join(&name);
        info!(
            "upload set {:?} to {:?} as {name:?}",
            set.name(),
            self.identifier()
        );
        clone_into_place(&self.backend, set.location(), &destination, true)?;

        Ok(Some(RemoteSet {
            path: destination,
            backend: self.backend.clone(),
        }))
    }
}
