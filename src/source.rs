// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source repository handling.
//!
//! The __source repository__ is the project whose commits get derived. It is
//! shared mutable state: deriving a commit means checking it out over whatever
//! the user currently has in their working tree. Thus, before touching it the
//! engine takes a [`SourceGuard`] that remembers where HEAD was and stashes
//! any uncommitted work. Releasing the guard puts everything back the way it
//! was, whether the run finished, a derivation failed, or the engine itself
//! bailed out with an error.

use crate::backend::{
    Backend, BackendError, Git2Backend, HeadState, Identity, Timestamp, STASH_MESSAGE,
};

use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};

/// A commit of the source repository selected for derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCommit {
    /// Full commit identifier.
    pub id: String,

    /// Who authored the commit.
    pub author: Identity,

    /// When the commit was authored.
    pub time: Timestamp,

    /// First line of the commit message.
    pub summary: String,
}

impl SourceCommit {
    /// Abbreviated commit identifier for display purposes.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Abbreviate commit identifier to at most seven characters.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(7) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Source repository whose commits get derived.
#[derive(Debug, Clone)]
pub struct SourceRepo<B = Git2Backend>
where
    B: Backend,
{
    path: PathBuf,
    backend: B,
}

impl<B> SourceRepo<B>
where
    B: Backend,
{
    /// Open source repository at target path.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::NotARepository`] if path does not hold a
    ///   repository.
    pub fn open(path: impl Into<PathBuf>, backend: B) -> Result<Self> {
        let path = path.into();
        if !backend.is_repository(&path) {
            return Err(SourceError::NotARepository { path });
        }

        Ok(Self { path, backend })
    }

    /// Path to the working tree of the source repository.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a revision expression into a source commit.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::Backend`] if revision cannot be resolved.
    pub fn resolve(&self, revision: impl AsRef<str>) -> Result<SourceCommit> {
        Ok(self.backend.resolve_commit(&self.path, revision.as_ref())?)
    }

    /// Resolve a listing of revision expressions, keeping their order.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::Backend`] if any revision cannot be resolved.
    pub fn resolve_all(
        &self,
        revisions: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Vec<SourceCommit>> {
        revisions
            .into_iter()
            .map(|revision| self.resolve(revision))
            .collect()
    }

    /// Last `count` first-parent commits reachable from HEAD, oldest first.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::Backend`] if history cannot be walked.
    pub fn recent(&self, count: usize) -> Result<Vec<SourceCommit>> {
        Ok(self.backend.recent_commits(&self.path, count)?)
    }

    /// Check out a commit over the working tree.
    ///
    /// Only meant to be called while a [`SourceGuard`] is held.
    pub(crate) fn checkout(&self, commit: &SourceCommit) -> Result<()> {
        info!("checkout source commit {} - {}", commit.short_id(), commit.summary);
        Ok(self.backend.checkout_ref(&self.path, &commit.id)?)
    }

    /// Save current state of source repository.
    ///
    /// Records what HEAD points at, and stashes uncommitted changes including
    /// untracked files. The returned guard restores all of it.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::Backend`] if HEAD cannot be determined, or
    ///   uncommitted changes cannot be stashed.
    #[instrument(skip(self), level = "debug")]
    pub fn preserve(&self) -> Result<SourceGuard<'_, B>> {
        let head = self.backend.head_state(&self.path)?;
        let stashed = self.backend.stash_save(&self.path)?;
        debug!("preserve source at {head:?}, stashed: {stashed}");

        Ok(SourceGuard {
            source: self,
            head,
            stashed,
            restored: false,
        })
    }
}

/// Scoped hold over the source repository's pre-run state.
///
/// Dropping the guard without calling [`SourceGuard::restore`] still restores
/// the source repository, but failures can then only be logged.
#[derive(Debug)]
pub struct SourceGuard<'s, B = Git2Backend>
where
    B: Backend,
{
    source: &'s SourceRepo<B>,
    head: HeadState,
    stashed: bool,
    restored: bool,
}

impl<B> SourceGuard<'_, B>
where
    B: Backend,
{
    /// Put source repository back to its recorded state.
    ///
    /// # Errors
    ///
    /// - Return [`SourceError::Backend`] if HEAD cannot be restored, or the
    ///   stash cannot be reapplied.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.restore_inner()
    }

    fn restore_inner(&self) -> Result<()> {
        let backend = &self.source.backend;
        let path = &self.source.path;
        debug!("restore source to {:?}", self.head);

        let result = backend
            .restore_head(path, &self.head)
            .and_then(|_| backend.remove_untracked(path))
            .and_then(|_| {
                if self.stashed {
                    backend.stash_restore(path)
                } else {
                    Ok(())
                }
            });

        // INVARIANT: Stash is only dropped by a successful pop.
        if result.is_err() && self.stashed {
            error!(
                "uncommitted changes of {:?} remain stashed as {STASH_MESSAGE:?}",
                path.display()
            );
        }
        result?;

        Ok(())
    }
}

impl<B> Drop for SourceGuard<'_, B>
where
    B: Backend,
{
    fn drop(&mut self) {
        if self.restored {
            return;
        }

        if let Err(err) = self.restore_inner() {
            error!(
                "failed to restore source repository at {:?}: {err:?}",
                self.source.path.display()
            );
        }
    }
}

/// Source repository error types.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Path does not hold a repository.
    #[error("source path {:?} is not a repository", path.display())]
    NotARepository { path: PathBuf },

    /// Backend operation fails.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Friendly result alias :3
pub type Result<T, E = SourceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs;
    use tempfile::TempDir;

    fn commit(backend: &Git2Backend, repo: &Path, contents: &str) -> anyhow::Result<String> {
        fs::write(repo.join("value.txt"), contents)?;
        let author = Identity::new("John Doe", "john@doe.com");
        Ok(backend.commit_working_tree(repo, contents, &author, Timestamp::new(1, 0))?)
    }

    #[test]
    fn open_rejects_plain_directory() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let result = SourceRepo::open(root.path(), Git2Backend::new());
        assert!(matches!(result, Err(SourceError::NotARepository { .. })));

        Ok(())
    }

    #[test]
    fn guard_restores_head_and_uncommitted_changes() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let backend = Git2Backend::new();
        backend.init_repository(root.path())?;
        let first = commit(&backend, root.path(), "one")?;
        commit(&backend, root.path(), "two")?;
        fs::write(root.path().join("value.txt"), "dirty")?;

        let source = SourceRepo::open(root.path(), backend)?;
        let before = backend.head_state(root.path())?;
        {
            let guard = source.preserve()?;
            assert_eq!(fs::read_to_string(root.path().join("value.txt"))?, "two");

            source.checkout(&source.resolve(&first)?)?;
            assert_eq!(fs::read_to_string(root.path().join("value.txt"))?, "one");
            fs::create_dir_all(root.path().join("build"))?;
            fs::write(root.path().join("build").join("out.txt"), "one")?;
            drop(guard);
        }

        assert_eq!(backend.head_state(root.path())?, before);
        assert_eq!(fs::read_to_string(root.path().join("value.txt"))?, "dirty");
        assert!(!root.path().join("build").exists());

        Ok(())
    }

    #[test]
    fn failed_restore_keeps_uncommitted_changes_stashed() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let backend = Git2Backend::new();
        backend.init_repository(root.path())?;
        let first = commit(&backend, root.path(), "one")?;
        commit(&backend, root.path(), "two")?;
        fs::write(root.path().join("value.txt"), "dirty")?;

        let source = SourceRepo::open(root.path(), backend)?;
        let HeadState::Branch(branch) = backend.head_state(root.path())? else {
            panic!("fresh repository should have HEAD on a branch");
        };
        let guard = source.preserve()?;
        source.checkout(&source.resolve(&first)?)?;

        // INVARIANT: Branch HEAD was on vanishes, so HEAD cannot be restored.
        let mut repo = Repository::open(root.path())?;
        repo.find_reference(&branch)?.delete()?;
        assert!(guard.restore().is_err());

        let mut messages = Vec::new();
        repo.stash_foreach(|_, message, _| {
            messages.push(message.to_owned());
            true
        })?;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains(STASH_MESSAGE));

        Ok(())
    }

    #[test_case("0123456789abcdef", "0123456"; "full id")]
    #[test_case("abc", "abc"; "shorter than abbreviation")]
    #[test_case("näïve-tag", "näïve-t"; "multibyte")]
    #[test_case("ééééééééé", "ééééééé"; "all multibyte")]
    #[test]
    fn abbreviates_by_characters(id: &str, expect: &str) {
        assert_eq!(short_id(id), expect);
    }

    #[test]
    fn recent_lists_oldest_first() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let backend = Git2Backend::new();
        backend.init_repository(root.path())?;
        commit(&backend, root.path(), "one")?;
        let second = commit(&backend, root.path(), "two")?;
        let third = commit(&backend, root.path(), "three")?;

        let source = SourceRepo::open(root.path(), backend)?;
        let ids = source
            .recent(2)?
            .into_iter()
            .map(|commit| commit.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![second, third]);

        Ok(())
    }
}
