// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Derivation pipeline.
//!
//! The [`DerivationEngine`] ties everything together. It walks a caller
//! ordered listing of source commits, checks each one out in the source
//! repository, runs the derivation on it, and records the outcome into a
//! [`WorkTree`]. Once every commit is processed the work tree becomes a new
//! immutable set in the local store.
//!
//! Derivation failures never abort a run. They are recorded as invalid
//! snapshots instead. Anything else going wrong, e.g., the backend failing to
//! commit, aborts the run without leaving a set behind. Either way the source
//! repository is put back exactly the way it was found.
//!
//! The engine also resolves snapshots for checkout, searching the local store
//! before any remote collection, and publishes local sets to the first
//! writable remote collection.

use crate::{
    backend::{Backend, Git2Backend},
    derive::{derive_guarded, Derive, Notes},
    set::{
        available_name, LocalSet, RemoteSet, SetCollection, SetError, SnapshotNote, SnapshotSet,
        WorkTree,
    },
    source::{SourceCommit, SourceError, SourceRepo},
    store::{LocalStore, StoreError},
};

use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Orchestrator of derivation runs over one local store.
pub struct DerivationEngine<D, B = Git2Backend>
where
    D: Derive,
    B: Backend,
{
    store: LocalStore<B>,
    source: SourceRepo<B>,
    deriver: D,
    remotes: Vec<Box<dyn SetCollection<B>>>,
    progress: ProgressBar,
}

impl<D, B> DerivationEngine<D, B>
where
    D: Derive,
    B: Backend,
{
    /// Construct new engine without any remote collections.
    pub fn new(store: LocalStore<B>, source: SourceRepo<B>, deriver: D) -> Self {
        Self {
            store,
            source,
            deriver,
            remotes: Vec::new(),
            progress: ProgressBar::hidden(),
        }
    }

    /// Append remote collection to the search order.
    pub fn with_remote(mut self, remote: impl SetCollection<B> + 'static) -> Self {
        self.remotes.push(Box::new(remote));
        self
    }

    /// Report progress of derivation runs through target bar.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }

    pub fn source(&self) -> &SourceRepo<B> {
        &self.source
    }

    pub fn remotes(&self) -> &[Box<dyn SetCollection<B>>] {
        &self.remotes
    }

    /// Build new set out of target source commits.
    ///
    /// Commits are processed in the order given. A commit listed more than
    /// once is only derived the first time.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::SetAlreadyExists`] if store holds set of the
    ///   same name.
    /// - Return [`EngineError::Source`] if source repository cannot be
    ///   preserved, checked out, or restored.
    /// - Return [`EngineError::Set`] if snapshots cannot be recorded, or the
    ///   set cannot be finalized.
    #[instrument(skip(self, commits), level = "debug")]
    pub fn build_set(&mut self, name: &str, commits: &[SourceCommit]) -> Result<LocalSet<B>> {
        self.ensure_free(name)?;
        let worktree = self.store.new_worktree(name)?;
        info!("build set {name:?} from {} commits", commits.len());

        self.run(name, worktree, commits)
    }

    /// Build new set holding every snapshot of `base` plus target commits.
    ///
    /// Commits `base` already holds a snapshot of are skipped without running
    /// the derivation. The base set itself is left untouched.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::SetNotFound`] if store holds no set `base`.
    /// - Return [`EngineError::SetAlreadyExists`] if store holds set `name`.
    /// - Return [`EngineError::Source`] if source repository cannot be
    ///   preserved, checked out, or restored.
    /// - Return [`EngineError::Set`] if snapshots cannot be recorded, or the
    ///   set cannot be finalized.
    #[instrument(skip(self, commits), level = "debug")]
    pub fn extend_set(
        &mut self,
        base: &str,
        name: &str,
        commits: &[SourceCommit],
    ) -> Result<LocalSet<B>> {
        let base_set = self
            .store
            .set(base)?
            .ok_or_else(|| EngineError::SetNotFound {
                name: base.to_owned(),
            })?;
        self.ensure_free(name)?;
        let worktree = self.store.new_worktree_from(name, &base_set)?;
        info!(
            "extend set {base:?} into {name:?} holding {} snapshots",
            worktree.len()
        );

        self.run(name, worktree, commits)
    }

    /// Check out snapshot of source commit into target directory.
    ///
    /// Uses the store's default checkout directory if no target is given.
    /// Returns the directory the snapshot was extracted into.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::CommitNotFound`] if no set holds the commit.
    /// - Return [`EngineError::Set`] if snapshot note cannot be read, or
    ///   snapshot cannot be extracted. Target is left untouched if the note
    ///   cannot be read.
    #[instrument(skip(self, target), level = "debug")]
    pub fn checkout(&self, id: &str, target: Option<&Path>) -> Result<PathBuf> {
        let target = target
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.store.default_checkout_dir());
        let set = self.resolve(id)?;

        // INVARIANT: Read snapshot note first, so failures leave target untouched.
        let snapshot = set.snapshot(id)?;
        set.checkout(id, &target)?;
        if !snapshot.valid {
            warn!("snapshot of {id} in {:?} is invalid, checked out nothing", set.name());
        }
        info!("checked out {id} from {:?} into {:?}", set.name(), target.display());

        Ok(target)
    }

    /// Find the first set holding a snapshot of source commit.
    ///
    /// Local sets are searched first, by name. Then remote collections are
    /// searched in configured order, each by set name. A remote match is
    /// downloaded into the local store, so later lookups stay local.
    ///
    /// Remote collections that cannot be queried are skipped with a warning.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::CommitNotFound`] if no set holds the commit.
    /// - Return [`EngineError::Set`] if remote match cannot be downloaded.
    #[instrument(skip(self), level = "debug")]
    pub fn resolve(&self, id: &str) -> Result<LocalSet<B>> {
        if let Some(set) = self.store.sets_with_commit(id)?.into_iter().next() {
            debug!("found {id} in local set {:?}", set.name());
            return Ok(set);
        }

        for remote in &self.remotes {
            let found = match remote.sets_with_commit(id) {
                Ok(found) => found,
                Err(err) => {
                    warn!("skip remote collection {:?}: {err}", remote.identifier());
                    continue;
                }
            };

            if let Some(set) = found.into_iter().next() {
                debug!("found {id} in remote set {:?}", set.identifier());
                return self.download(&set);
            }
        }

        Err(EngineError::CommitNotFound { id: id.to_owned() })
    }

    /// Upload every local set to the first writable remote collection.
    ///
    /// Sets the collection already holds are left alone. Returns the sets
    /// newly created in the collection.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::NoWritableRemote`] if every remote collection
    ///   is readonly, or none are configured.
    /// - Return [`EngineError::Set`] if any upload fails.
    #[instrument(skip(self), level = "debug")]
    pub fn upload_all(&self) -> Result<Vec<RemoteSet<B>>> {
        let remote = self
            .remotes
            .iter()
            .find(|remote| !remote.is_readonly())
            .ok_or(EngineError::NoWritableRemote)?;

        let mut uploaded = Vec::new();
        for set in self.store.sets()? {
            if let Some(remote_set) = remote.upload(&set)? {
                uploaded.push(remote_set);
            }
        }
        info!(
            "uploaded {} sets to {:?}",
            uploaded.len(),
            remote.identifier()
        );

        Ok(uploaded)
    }

    /// Summarize local sets and remote collections.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Store`] if local sets cannot be listed.
    /// - Return [`EngineError::Set`] if any set cannot be queried.
    pub fn status(&self) -> Result<Status> {
        let mut local = Vec::new();
        for set in self.store.sets()? {
            local.push(SetStatus {
                name: set.name(),
                commits: set.commit_ids()?,
            });
        }

        let mut remotes = Vec::new();
        for remote in &self.remotes {
            let mut sets = Vec::new();
            for set in remote.sets()? {
                sets.push(SetStatus {
                    name: set.name(),
                    commits: set.commit_ids()?,
                });
            }
            remotes.push(CollectionStatus {
                identifier: remote.identifier(),
                readonly: remote.is_readonly(),
                sets,
            });
        }

        Ok(Status { local, remotes })
    }

    /// Remove work trees left over from interrupted runs.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Store`] if any work tree cannot be removed.
    pub fn prune(&self) -> Result<Vec<String>> {
        Ok(self.store.prune_worktrees()?)
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        if self.store.has_set(name)? {
            return Err(EngineError::SetAlreadyExists {
                name: name.to_owned(),
            });
        }

        Ok(())
    }

    fn run(
        &mut self,
        name: &str,
        mut worktree: WorkTree<B>,
        commits: &[SourceCommit],
    ) -> Result<LocalSet<B>> {
        // INVARIANT: A failed run never leaves a set behind.
        if let Err(err) = self.derive_all(&mut worktree, commits) {
            if let Err(discard_err) = worktree.discard() {
                warn!("failed to discard work tree of {name:?}: {discard_err}");
            }
            return Err(err);
        }

        let set = worktree.finalize(self.store.set_path(name)?)?;
        info!("set {name:?} ready");

        Ok(set)
    }

    fn derive_all(&mut self, worktree: &mut WorkTree<B>, commits: &[SourceCommit]) -> Result<()> {
        let Self {
            source,
            deriver,
            progress,
            ..
        } = self;

        let guard = source.preserve()?;
        progress.set_length(commits.len() as u64);
        progress.set_position(0);

        for commit in commits {
            progress.set_message(format!("{} {}", commit.short_id(), commit.summary));
            if worktree.has_tag(&commit.id) {
                info!("skip {}: already derived", commit.short_id());
            } else {
                insert_derived_commit(source, deriver, worktree, commit)?;
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        guard.restore()?;

        Ok(())
    }

    fn download(&self, set: &RemoteSet<B>) -> Result<LocalSet<B>> {
        let sets_dir = self.store.sets_dir();
        let name = available_name(&set.name(), |name| sets_dir.join(name).exists());

        Ok(set.download(self.store.set_path(&name)?)?)
    }
}

/// Derive one source commit and record the outcome as a snapshot.
fn insert_derived_commit<D, B>(
    source: &SourceRepo<B>,
    deriver: &mut D,
    worktree: &mut WorkTree<B>,
    commit: &SourceCommit,
) -> Result<()>
where
    D: Derive,
    B: Backend,
{
    source.checkout(commit)?;

    let mut notes = Notes::new();
    let output = match derive_guarded(deriver, source.path(), &mut notes) {
        Ok(output) => {
            info!("derived {} into {:?}", commit.short_id(), output.display());
            Some(output)
        }
        Err(err) => {
            warn!("derivation of {} failed: {err}", commit.short_id());
            None
        }
    };

    let note = SnapshotNote {
        valid: output.is_some(),
        data: notes,
    };
    worktree.commit_snapshot(
        output.as_deref(),
        &commit.summary,
        &commit.author,
        commit.time,
        &commit.id,
        &note,
    )?;

    Ok(())
}

/// Progress bar styled for derivation runs.
///
/// # Errors
///
/// - Return [`EngineError::ProgressTemplate`] if bar template is malformed.
pub fn progress_bar() -> Result<ProgressBar> {
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}] {pos}/{len}",
    )?
    .progress_chars("-Cco.");

    Ok(ProgressBar::new(0).with_style(style))
}

/// Overview of local sets and remote collections.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    pub local: Vec<SetStatus>,
    pub remotes: Vec<CollectionStatus>,
}

/// Name and held commits of one set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetStatus {
    pub name: String,
    pub commits: Vec<String>,
}

/// Sets held by one remote collection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionStatus {
    pub identifier: String,
    pub readonly: bool,
    pub sets: Vec<SetStatus>,
}

/// All possible error types for derivation engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Local store already holds set of target name.
    #[error("set {name:?} already exists")]
    SetAlreadyExists { name: String },

    /// Local store holds no set of target name.
    #[error("set {name:?} does not exist")]
    SetNotFound { name: String },

    /// No local or remote set holds a snapshot of source commit.
    #[error("no set holds a snapshot of commit {id}")]
    CommitNotFound { id: String },

    /// Every configured remote collection is readonly.
    #[error("no writable remote collection configured")]
    NoWritableRemote,

    /// Progress bar template is malformed.
    #[error(transparent)]
    ProgressTemplate(#[from] indicatif::style::TemplateError),

    /// Set operation fails.
    #[error(transparent)]
    Set(#[from] SetError),

    /// Local store operation fails.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Source repository operation fails.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Friendly result alias :3
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
