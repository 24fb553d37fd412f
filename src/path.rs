// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution and directory utilities.
//!
//! Determine relevent path information for the local store, and provide the
//! small set of directory operations that snapshot staging and checkout need:
//! clearing a directory, and copying one directory's content into another.

use ignore::WalkBuilder;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Determine default absolute path to the local store directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/derivedrepo-store` as the
/// default absolute path for a local store. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`Error::NoWayHome`] if data directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_store_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("derivedrepo-store"))
        .ok_or(Error::NoWayHome)
}

/// Resolve path relative to a base directory unless it is already absolute.
pub fn absolute_from(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        return path.to_path_buf();
    }

    base.as_ref().join(path)
}

/// Create directory and all missing parents.
///
/// # Errors
///
/// - Return [`Error::CreateDir`] if directory cannot be created.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    mkdirp::mkdirp(path.as_ref()).map_err(|err| Error::CreateDir {
        source: err,
        path: path.as_ref().to_path_buf(),
    })?;

    Ok(())
}

/// Check if directory has no entries besides hidden ones.
///
/// A missing directory counts as empty.
///
/// # Errors
///
/// - Return [`Error::ReadDir`] if directory cannot be read.
pub fn is_dir_empty_ignoring_hidden(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(true);
    }

    for entry in read_dir(path)? {
        if !entry.file_name().to_string_lossy().starts_with('.') {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Remove all entries of a directory except those named in `excludes`.
///
/// The directory itself stays in place.
///
/// # Errors
///
/// - Return [`Error::ReadDir`] if directory cannot be read.
/// - Return [`Error::Remove`] if an entry cannot be removed.
pub fn clear_directory(path: impl AsRef<Path>, excludes: &[&str]) -> Result<()> {
    for entry in read_dir(path.as_ref())? {
        if excludes.contains(&entry.file_name().to_string_lossy().as_ref()) {
            continue;
        }

        let entry_path = entry.path();
        let result = match entry.file_type() {
            Ok(kind) if kind.is_dir() => fs::remove_dir_all(&entry_path),
            _ => fs::remove_file(&entry_path),
        };
        result.map_err(|err| Error::Remove {
            source: err,
            path: entry_path.clone(),
        })?;
    }

    Ok(())
}

/// Copy entire content of `src` into `dst`.
///
/// Hidden files and files matched by ignore rules are copied too. Nested
/// `.git` directories are skipped. Symbolic links are recreated as links on
/// unix instead of being followed.
///
/// # Errors
///
/// - Return [`Error::Walk`] if `src` cannot be traversed.
/// - Return [`Error::Copy`] if any entry cannot be copied.
pub fn copy_dir_content(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    let walker = WalkBuilder::new(src)
        .standard_filters(false)
        .follow_links(false)
        .filter_entry(|entry| entry.file_name() != ".git")
        .build();

    for entry in walker {
        let entry = entry?;
        let relative = match entry.path().strip_prefix(src) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative,
            _ => continue,
        };
        let target = dst.join(relative);
        let copy_err = |err| Error::Copy {
            source: err,
            path: entry.path().to_path_buf(),
        };

        match entry.file_type() {
            Some(kind) if kind.is_dir() => fs::create_dir_all(&target).map_err(copy_err)?,
            Some(kind) if kind.is_symlink() => copy_symlink(entry.path(), &target).map_err(copy_err)?,
            _ => {
                fs::copy(entry.path(), &target).map_err(copy_err)?;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

fn read_dir(path: &Path) -> Result<Vec<fs::DirEntry>> {
    let read_err = |err| Error::ReadDir {
        source: err,
        path: path.to_path_buf(),
    };

    fs::read_dir(path)
        .map_err(read_err)?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(read_err)
}

/// Path utility error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No way to determine user's data directory.
    ///
    /// # See Also
    ///
    /// - [`dirs::data_dir`](https://docs.rs/dirs/latest/dirs/fn.data_dir.html)
    #[error("cannot determine absolute path to user's data directory")]
    NoWayHome,

    /// Directory cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory cannot be read.
    #[error("failed to read directory {:?}", path.display())]
    ReadDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory entry cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory entry cannot be copied.
    #[error("failed to copy {:?}", path.display())]
    Copy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory tree cannot be traversed.
    #[error(transparent)]
    Walk(#[from] ignore::Error),
}

/// Friendly result alias :3
pub type Result<T, E = Error> = std::result::Result<T, E>;
