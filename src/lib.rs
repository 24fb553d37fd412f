// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Derived artifacts indexed by source commits.
//!
//! Derivedrepo runs a user supplied derivation, e.g., a build, against
//! checkouts of selected commits of a __source repository__, and records each
//! result as an immutable __snapshot__ addressed by the source commit
//! identifier. Derivations that fail are recorded too, as invalid snapshots,
//! so they are never attempted twice in the same set.
//!
//! Snapshots are grouped into named __sets__. Sets live in a local store,
//! can be shared through remote set collections, and are searched local
//! first when a snapshot gets checked out.
//!
//! # See Also
//!
//! 1. [`DerivationEngine`]
//! 2. [`set`]
//! 3. [`store`]

pub mod backend;
pub mod config;
pub mod derive;
pub mod engine;
pub mod path;
pub mod set;
pub mod source;
pub mod store;

pub use backend::{Backend, BackendError, Git2Backend, Identity, Timestamp};
pub use config::{Config, ConfigError, RemoteCollectionEntry};
pub use derive::{DerivationError, Derive, Notes, ScriptDeriver};
pub use engine::{DerivationEngine, EngineError, Status};
pub use path::default_store_dir;
pub use set::{
    FolderSetCollection, LocalSet, RemoteSet, SetCollection, SetError, Snapshot, SnapshotNote,
    SnapshotSet, WorkTree,
};
pub use source::{SourceCommit, SourceError, SourceGuard, SourceRepo};
pub use store::{LocalStore, StoreError};
