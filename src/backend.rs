// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control backend.
//!
//! Derivedrepo never stores snapshot content itself. Every durable write is
//! delegated to a version control system through the [`Backend`] trait:
//! committing a staged tree, tagging it with the source commit identifier,
//! attaching a JSON note, cloning a repository somewhere else, and so on.
//!
//! # Path Keyed Operations
//!
//! Each operation names the repository directory it acts upon instead of
//! holding an open handle. Sets, work trees, and the source repository are all
//! just directories as far as the rest of the crate is concerned, which keeps
//! ownership of those directories with whoever holds the path.
//!
//! # Notes As Metadata
//!
//! The [`Git2Backend`] stores snapshot metadata as git notes under the default
//! notes reference. Notes are transferred along with branches and tags
//! whenever a repository is cloned, so metadata never gets separated from the
//! snapshot it describes.

use crate::source::SourceCommit;

use git2::{
    build::CheckoutBuilder, AutotagOption, BranchType, Commit, ErrorCode, FetchOptions,
    IndexAddOption, ObjectType, Oid, Repository, RepositoryInitOptions, Signature, Sort,
    StashApplyOptions, StashFlags, StatusOptions, Time,
};
use std::{
    collections::VecDeque,
    ffi::OsStr,
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Branch every repository created by derivedrepo starts on.
pub const DEFAULT_BRANCH: &str = "main";

/// Message that uncommitted changes of the source repository are stashed under.
pub const STASH_MESSAGE: &str = "derivedrepo: preserve source state";

/// Refspecs that mirror everything a set is made of.
const MIRROR_REFSPECS: [&str; 3] = [
    "+refs/heads/*:refs/heads/*",
    "+refs/tags/*:refs/tags/*",
    "+refs/notes/*:refs/notes/*",
];

/// Name and email of whoever authored a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl Display for Identity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{} <{}>", self.name, self.email)
    }
}

/// Point in time with the timezone offset it was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub offset_minutes: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, offset_minutes: i32) -> Self {
        Self {
            seconds,
            offset_minutes,
        }
    }
}

/// What HEAD of a repository currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadState {
    /// HEAD is attached to a branch, stored by full reference name.
    Branch(String),

    /// HEAD is detached at a commit.
    Detached(String),
}

/// Operations derivedrepo needs from a version control system.
///
/// Commit references are passed around as plain strings, i.e., full
/// hexadecimal object ids for git.
pub trait Backend: Clone {
    /// Initialize a new repository with a working tree at target path.
    fn init_repository(&self, path: &Path) -> Result<()>;

    /// Clone repository at source into destination.
    ///
    /// Branches, tags, and metadata are all transferred. A bare clone has no
    /// working tree, a non-bare clone gets its default branch checked out.
    fn clone_repository(&self, source: &str, destination: &Path, bare: bool) -> Result<()>;

    /// Replace working tree content with the tree of target reference.
    ///
    /// Leaves HEAD detached at the commit the reference resolves to.
    fn checkout_ref(&self, repo: &Path, reference: &str) -> Result<()>;

    /// Commit the entire working tree as it currently stands.
    ///
    /// Anything no longer present in the working tree is dropped from the
    /// commit. Empty commits are always allowed.
    fn commit_working_tree(
        &self,
        repo: &Path,
        message: &str,
        author: &Identity,
        time: Timestamp,
    ) -> Result<String>;

    /// Attach label to a commit.
    fn tag(&self, repo: &Path, commit: &str, label: &str) -> Result<()>;

    /// Check if label is attached to any commit.
    fn has_tag(&self, repo: &Path, label: &str) -> Result<bool>;

    /// List every label in the repository.
    fn list_tags(&self, repo: &Path) -> Result<Vec<String>>;

    /// Resolve label into the commit it is attached to.
    fn resolve_tag(&self, repo: &Path, label: &str) -> Result<Option<String>>;

    /// Attach JSON metadata to a commit.
    fn attach_metadata(
        &self,
        repo: &Path,
        commit: &str,
        metadata: &serde_json::Value,
    ) -> Result<()>;

    /// Read JSON metadata attached to a commit, if any.
    fn read_metadata(&self, repo: &Path, commit: &str) -> Result<Option<serde_json::Value>>;

    /// Write tracked content of a commit into a plain directory.
    fn extract_tree(&self, repo: &Path, commit: &str, target: &Path) -> Result<()>;

    /// Commit that HEAD currently resolves to, if any.
    fn head_commit(&self, repo: &Path) -> Result<Option<String>>;

    /// Determine what HEAD points at.
    fn head_state(&self, repo: &Path) -> Result<HeadState>;

    /// Point HEAD back at a previously recorded state, forcing the working
    /// tree to match.
    fn restore_head(&self, repo: &Path, state: &HeadState) -> Result<()>;

    /// Save uncommitted changes, untracked files included.
    ///
    /// Returns `false` if there was nothing to save.
    fn stash_save(&self, repo: &Path) -> Result<bool>;

    /// Restore the most recently saved uncommitted changes.
    fn stash_restore(&self, repo: &Path) -> Result<()>;

    /// Delete untracked files from the working tree.
    fn remove_untracked(&self, repo: &Path) -> Result<()>;

    /// Check if path holds a repository at all.
    fn is_repository(&self, path: &Path) -> bool;

    /// Resolve revision expression into a commit.
    fn resolve_commit(&self, repo: &Path, revision: &str) -> Result<SourceCommit>;

    /// Last `count` first-parent commits reachable from HEAD, oldest first.
    fn recent_commits(&self, repo: &Path, count: usize) -> Result<Vec<SourceCommit>>;
}

/// Backend implemented through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Backend;

impl Git2Backend {
    /// Construct new libgit2 backend.
    pub fn new() -> Self {
        Self
    }

    fn open(&self, path: &Path) -> Result<Repository> {
        Repository::open(path).map_err(|err| BackendError::Open {
            source: err,
            path: path.to_path_buf(),
        })
    }

    fn init_with(&self, path: &Path, bare: bool) -> Result<Repository> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(DEFAULT_BRANCH);
        opts.bare(bare);
        opts.mkpath(true);

        Ok(Repository::init_opts(path, &opts)?)
    }

    // INVARIANT: Never fail on missing user configuration.
    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(signature) => Ok(signature),
            Err(_) => Ok(Signature::now("derivedrepo", "derivedrepo@localhost")?),
        }
    }

    fn find_commit<'r>(repo: &'r Repository, commit: &str) -> Result<Commit<'r>> {
        Ok(repo.find_commit(Oid::from_str(commit)?)?)
    }

    fn head_parent(repo: &Repository) -> Result<Option<Commit<'_>>> {
        match repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn default_branch(repo: &Repository) -> Result<Option<String>> {
        let main = format!("refs/heads/{DEFAULT_BRANCH}");
        if repo.find_reference(&main).is_ok() {
            return Ok(Some(main));
        }

        for branch in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.get().name() {
                return Ok(Some(name.to_owned()));
            }
        }

        Ok(None)
    }
}

impl Backend for Git2Backend {
    #[instrument(skip(self), level = "debug")]
    fn init_repository(&self, path: &Path) -> Result<()> {
        self.init_with(path, false)?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn clone_repository(&self, source: &str, destination: &Path, bare: bool) -> Result<()> {
        let repo = self.init_with(destination, bare)?;

        // INVARIANT: Anonymous remote, so clones never point back at their origin.
        let mut remote = repo.remote_anonymous(source)?;
        let mut fo = FetchOptions::new();
        fo.download_tags(AutotagOption::None);
        remote.fetch(&MIRROR_REFSPECS, Some(&mut fo), None)?;

        // INVARIANT: Empty origin leaves HEAD unborn on the default branch.
        if let Some(branch) = Self::default_branch(&repo)? {
            repo.set_head(&branch)?;
            if !bare {
                repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            }
        }

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn checkout_ref(&self, repo: &Path, reference: &str) -> Result<()> {
        let repo = self.open(repo)?;
        let commit = repo.revparse_single(reference)?.peel_to_commit()?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        repo.set_head_detached(commit.id())?;

        Ok(())
    }

    #[instrument(skip(self, author, time), level = "debug")]
    fn commit_working_tree(
        &self,
        repo: &Path,
        message: &str,
        author: &Identity,
        time: Timestamp,
    ) -> Result<String> {
        let repo = self.open(repo)?;

        // INVARIANT: Index mirrors the working tree exactly, ignore rules included.
        let mut index = repo.index()?;
        index.clear()?;
        index.add_all(
            ["*"].iter(),
            IndexAddOption::DEFAULT | IndexAddOption::FORCE,
            None,
        )?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let signature = Signature::new(
            &author.name,
            &author.email,
            &Time::new(time.seconds, time.offset_minutes),
        )?;
        let parent = Self::head_parent(&repo)?;
        let parents = parent.iter().collect::<Vec<_>>();
        let oid = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        debug!("committed {oid} with tree {}", tree.id());

        Ok(oid.to_string())
    }

    fn tag(&self, repo: &Path, commit: &str, label: &str) -> Result<()> {
        let repo = self.open(repo)?;
        let object = repo.find_object(Oid::from_str(commit)?, None)?;
        repo.tag_lightweight(label, &object, false)?;

        Ok(())
    }

    fn has_tag(&self, repo: &Path, label: &str) -> Result<bool> {
        Ok(self.list_tags(repo)?.iter().any(|tag| tag == label))
    }

    fn list_tags(&self, repo: &Path) -> Result<Vec<String>> {
        let repo = self.open(repo)?;
        let tags = repo.tag_names(None)?;

        Ok(tags.iter().flatten().map(str::to_owned).collect())
    }

    fn resolve_tag(&self, repo: &Path, label: &str) -> Result<Option<String>> {
        let repo = self.open(repo)?;
        let reference = match repo.find_reference(&format!("refs/tags/{label}")) {
            Ok(reference) => reference,
            Err(err) if is_missing(&err) || err.code() == ErrorCode::InvalidSpec => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Some(reference.peel_to_commit()?.id().to_string()))
    }

    fn attach_metadata(
        &self,
        repo: &Path,
        commit: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let repo = self.open(repo)?;
        let signature = Self::signature(&repo)?;
        let note = serde_json::to_string(metadata)?;
        repo.note(
            &signature,
            &signature,
            None,
            Oid::from_str(commit)?,
            &note,
            false,
        )?;

        Ok(())
    }

    fn read_metadata(&self, repo: &Path, commit: &str) -> Result<Option<serde_json::Value>> {
        let repo = self.open(repo)?;
        let note = match repo.find_note(None, Oid::from_str(commit)?) {
            Ok(note) => note,
            Err(err) if is_missing(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let message = note.message().ok_or_else(|| BackendError::NoteEncoding {
            commit: commit.to_owned(),
        })?;

        Ok(Some(serde_json::from_str(message)?))
    }

    #[instrument(skip(self), level = "debug")]
    fn extract_tree(&self, repo: &Path, commit: &str, target: &Path) -> Result<()> {
        let repo = self.open(repo)?;
        let commit = Self::find_commit(&repo, commit)?;
        let mut trees_and_paths = VecDeque::new();
        trees_and_paths.push_front((commit.tree()?, target.to_path_buf()));

        // Use DFS to traverse commit tree.
        while let Some((tree, path)) = trees_and_paths.pop_front() {
            fs::create_dir_all(&path).map_err(|err| BackendError::Io {
                source: err,
                path: path.clone(),
            })?;

            for tree_entry in &tree {
                let entry_path = path.join(bytes_to_path(tree_entry.name_bytes()));
                match tree_entry.kind() {
                    // INVARIANT: Hit a tree? Traverse it!
                    Some(ObjectType::Tree) => {
                        let next_tree = repo.find_tree(tree_entry.id())?;
                        trees_and_paths.push_front((next_tree, entry_path));
                    }
                    // INVARIANT: Hit a blob? Write it out!
                    Some(ObjectType::Blob) => {
                        let blob = repo.find_blob(tree_entry.id())?;
                        write_blob(&entry_path, blob.content(), tree_entry.filemode())?;
                    }
                    _ => continue,
                }
            }
        }

        Ok(())
    }

    fn head_commit(&self, repo: &Path) -> Result<Option<String>> {
        let repo = self.open(repo)?;
        let parent = Self::head_parent(&repo)?;

        Ok(parent.map(|commit| commit.id().to_string()))
    }

    fn head_state(&self, path: &Path) -> Result<HeadState> {
        let repo = self.open(path)?;
        let head = repo.head()?;
        if repo.head_detached()? {
            let target = head.target().ok_or_else(|| BackendError::InvalidHead {
                path: path.to_path_buf(),
            })?;
            return Ok(HeadState::Detached(target.to_string()));
        }

        let name = head.name().ok_or_else(|| BackendError::InvalidHead {
            path: path.to_path_buf(),
        })?;

        Ok(HeadState::Branch(name.to_owned()))
    }

    #[instrument(skip(self), level = "debug")]
    fn restore_head(&self, repo: &Path, state: &HeadState) -> Result<()> {
        let repo = self.open(repo)?;
        match state {
            HeadState::Branch(name) => repo.set_head(name)?,
            HeadState::Detached(commit) => repo.set_head_detached(Oid::from_str(commit)?)?,
        }
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn stash_save(&self, repo: &Path) -> Result<bool> {
        let mut repo = self.open(repo)?;
        let signature = Self::signature(&repo)?;
        match repo.stash_save(
            &signature,
            STASH_MESSAGE,
            Some(StashFlags::INCLUDE_UNTRACKED),
        ) {
            Ok(oid) => {
                debug!("stashed uncommitted changes as {oid}");
                Ok(true)
            }
            Err(err) if err.code() == ErrorCode::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    fn stash_restore(&self, repo: &Path) -> Result<()> {
        let mut repo = self.open(repo)?;
        let mut opts = StashApplyOptions::new();
        opts.reinstantiate_index();
        repo.stash_pop(0, Some(&mut opts))?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn remove_untracked(&self, path: &Path) -> Result<()> {
        let repo = self.open(path)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| BackendError::InvalidHead {
                path: path.to_path_buf(),
            })?
            .to_path_buf();

        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let untracked = repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter(|entry| entry.status().is_wt_new())
            .map(|entry| workdir.join(bytes_to_path(entry.path_bytes())))
            .collect::<Vec<_>>();

        for file in untracked {
            debug!("remove untracked {:?}", file.display());
            fs::remove_file(&file).map_err(|err| BackendError::Io {
                source: err,
                path: file.clone(),
            })?;

            // INVARIANT: Prune directories left empty, never the work tree itself.
            let mut parent = file.parent();
            while let Some(dir) = parent {
                if dir == workdir || fs::remove_dir(dir).is_err() {
                    break;
                }
                parent = dir.parent();
            }
        }

        Ok(())
    }

    fn is_repository(&self, path: &Path) -> bool {
        Repository::open(path).is_ok()
    }

    fn resolve_commit(&self, repo: &Path, revision: &str) -> Result<SourceCommit> {
        let repo = self.open(repo)?;
        let commit = repo.revparse_single(revision)?.peel_to_commit()?;

        Ok(SourceCommit::from(&commit))
    }

    fn recent_commits(&self, repo: &Path, count: usize) -> Result<Vec<SourceCommit>> {
        let repo = self.open(repo)?;
        let mut revwalk = repo.revwalk()?;
        revwalk.push_head()?;
        revwalk.simplify_first_parent()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL)?;

        let mut commits = Vec::new();
        for oid in revwalk.take(count) {
            commits.push(SourceCommit::from(&repo.find_commit(oid?)?));
        }
        commits.reverse();

        Ok(commits)
    }
}

impl From<&Commit<'_>> for SourceCommit {
    fn from(commit: &Commit<'_>) -> Self {
        let author = commit.author();
        let when = author.when();

        SourceCommit {
            id: commit.id().to_string(),
            author: Identity::new(
                String::from_utf8_lossy(author.name_bytes()),
                String::from_utf8_lossy(author.email_bytes()),
            ),
            time: Timestamp::new(when.seconds(), when.offset_minutes()),
            summary: commit.summary().unwrap_or_default().to_owned(),
        }
    }
}

fn is_missing(err: &git2::Error) -> bool {
    matches!(err.code(), ErrorCode::NotFound | ErrorCode::UnbornBranch)
}

fn write_blob(path: &Path, content: &[u8], filemode: i32) -> Result<()> {
    let io_err = |err| BackendError::Io {
        source: err,
        path: path.to_path_buf(),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::{symlink, PermissionsExt};

        if filemode == 0o120000 {
            return symlink(bytes_to_path(content), path).map_err(io_err);
        }

        fs::write(path, content).map_err(io_err)?;
        if filemode == 0o100755 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_err)?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = filemode;
        fs::write(path, content).map_err(io_err)?;
    }

    Ok(())
}

// Thanks from:
//
// https://github.com/rust-lang/git2-rs/blob/5bc3baa9694a94db2ca9cc256b5bce8a215f9013/
// src/util.rs#L85
#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::prelude::*;
    PathBuf::from(OsStr::from_bytes(bytes))
}
#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Backend operation error types.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Repository cannot be opened.
    #[error("failed to open repository at {:?}", path.display())]
    Open {
        #[source]
        source: git2::Error,
        path: PathBuf,
    },

    /// HEAD of repository cannot be determined.
    #[error("repository at {:?} has no usable HEAD", path.display())]
    InvalidHead { path: PathBuf },

    /// Note attached to commit is not valid UTF-8.
    #[error("note attached to commit {commit} is not valid UTF-8")]
    NoteEncoding { commit: String },

    /// File system operation fails.
    #[error("file system operation failed at {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Metadata cannot be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = BackendError> = std::result::Result<T, E>;
