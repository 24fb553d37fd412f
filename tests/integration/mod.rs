// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{read_tree, Workspace};

use derivedrepo::{
    derive, engine::EngineError, FolderSetCollection, Git2Backend, Identity, Notes,
    SetCollection, SetError, SnapshotSet, SourceCommit, Timestamp,
};

use anyhow::Result;
use git2::{Oid, Repository, Signature, Status, StatusOptions};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::{
    fs,
    path::{Path, PathBuf},
};

fn bogus_commit() -> SourceCommit {
    SourceCommit {
        id: "0123456789abcdef0123456789abcdef01234567".into(),
        author: Identity::new("John Doe", "john@doe.com"),
        time: Timestamp::new(0, 0),
        summary: "does not exist".into(),
    }
}

/// HEAD detachment, HEAD target, and status of every changed path.
fn repo_state(path: &Path) -> Result<(bool, Option<Oid>, Vec<(String, Status)>)> {
    let repo = Repository::open(path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo
        .statuses(Some(&mut opts))?
        .iter()
        .map(|entry| (entry.path().unwrap_or_default().to_owned(), entry.status()))
        .collect::<Vec<_>>();

    Ok((repo.head_detached()?, repo.head()?.target(), statuses))
}

#[test]
fn valid_and_invalid_snapshots() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "fail"])?;
    let (a, b) = (&commits[0].id, &commits[1].id);
    let mut engine = workspace.engine("store")?;

    let set = engine.build_set("s1", &commits)?;
    assert_eq!(set.name(), "s1");
    assert_eq!(set.commit_ids()?.len(), 2);

    let target = engine.checkout(a, Some(workspace.path("out").as_path()))?;
    let mut expect = std::collections::BTreeMap::new();
    expect.insert(PathBuf::from("out.txt"), b"1".to_vec());
    assert_eq!(read_tree(&target)?, expect);
    assert!(set.snapshot(a)?.valid);

    engine.checkout(b, Some(target.as_path()))?;
    assert!(read_tree(&target)?.is_empty());

    let snapshot = set.snapshot(b)?;
    assert!(!snapshot.valid);
    assert_eq!(snapshot.notes.get("value"), Some(&json!("fail")));

    Ok(())
}

#[test]
fn checkout_reproduces_output_byte_for_byte() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;

    let output = workspace.path("output");
    fs::create_dir_all(output.join("data/nested"))?;
    fs::create_dir_all(output.join("bin"))?;
    fs::write(output.join("data/blob.bin"), (0..=255u8).collect::<Vec<_>>())?;
    fs::write(output.join("data/nested/empty"), "")?;
    fs::write(output.join("bin/tool"), "#!/bin/sh\necho tool\n")?;
    fs::write(output.join(".hidden"), "dot")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(output.join("bin/tool"), fs::Permissions::from_mode(0o755))?;
    }

    let declared = output.clone();
    let deriver = move |_: &Path, _: &mut Notes| -> derive::Result<PathBuf> { Ok(declared.clone()) };
    let mut engine = workspace.engine_with("store", deriver)?;
    engine.build_set("s1", &commits)?;

    let target = engine.checkout(&commits[0].id, None)?;
    assert_eq!(target, engine.store().default_checkout_dir());
    assert_eq!(read_tree(&target)?, read_tree(&output)?);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(target.join("bin/tool"))?.permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    Ok(())
}

#[test]
fn checkout_clears_target_first() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let mut engine = workspace.engine("store")?;
    engine.build_set("s1", &commits)?;

    let target = workspace.path("out");
    fs::create_dir_all(target.join("stale"))?;
    fs::write(target.join("stale/file"), "old")?;
    engine.checkout(&commits[0].id, Some(target.as_path()))?;

    assert_eq!(read_tree(&target)?.len(), 1);
    assert!(!target.join("stale").exists());

    Ok(())
}

#[test]
fn unknown_commit_is_not_found() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let mut engine = workspace.engine("store")?;
    let set = engine.build_set("s1", &commits)?;

    let result = engine.checkout(&bogus_commit().id, None);
    assert!(matches!(result, Err(EngineError::CommitNotFound { .. })));

    let result = set.checkout(&bogus_commit().id, &workspace.path("out"));
    assert!(matches!(result, Err(SetError::CommitNotFound { .. })));

    Ok(())
}

#[test]
fn existing_set_name_is_refused() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "2"])?;
    let mut engine = workspace.engine("store")?;
    engine.build_set("s1", &commits[..1])?;

    let result = engine.build_set("s1", &commits);
    assert!(matches!(result, Err(EngineError::SetAlreadyExists { .. })));
    assert_eq!(workspace.calls.get(), 1);
    assert_eq!(engine.store().set("s1")?.unwrap().commit_ids()?.len(), 1);

    Ok(())
}

#[test]
fn extending_never_rederives_present_commits() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "fail", "3"])?;
    let mut engine = workspace.engine("store")?;

    engine.build_set("s1", &commits[..2])?;
    assert_eq!(workspace.calls.get(), 2);

    let extended = engine.extend_set("s1", "s2", &commits)?;
    assert_eq!(workspace.calls.get(), 3);

    let mut ids = extended.commit_ids()?;
    ids.sort();
    let mut expect = commits.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
    expect.sort();
    assert_eq!(ids, expect);
    assert!(!extended.snapshot(&commits[1].id)?.valid);
    assert_eq!(engine.store().set("s1")?.unwrap().commit_ids()?.len(), 2);

    let target = engine.checkout(&commits[0].id, Some(workspace.path("out").as_path()))?;
    assert_eq!(fs::read_to_string(target.join("out.txt"))?, "1");

    Ok(())
}

#[test]
fn extending_missing_set_fails() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let mut engine = workspace.engine("store")?;

    let result = engine.extend_set("nope", "s2", &commits);
    assert!(matches!(result, Err(EngineError::SetNotFound { .. })));
    assert_eq!(workspace.calls.get(), 0);

    Ok(())
}

#[test]
fn duplicate_commits_are_derived_once() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let repeated = vec![commits[0].clone(), commits[0].clone()];
    let mut engine = workspace.engine("store")?;

    let set = engine.build_set("s1", &repeated)?;
    assert_eq!(workspace.calls.get(), 1);
    assert_eq!(set.commit_ids()?, vec![commits[0].id.clone()]);

    Ok(())
}

#[test]
fn upload_and_download_round_trip() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "fail", "3"])?;
    let remote = workspace.path("remote");

    let mut engine = workspace.engine("store")?.with_remote(FolderSetCollection::new(
        &remote,
        false,
        Git2Backend::new(),
    ));
    let original = engine.build_set("s1", &commits)?;
    let uploaded = engine.upload_all()?;
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].name(), "s1");

    // Same set again is already present.
    assert!(engine.upload_all()?.is_empty());

    let downloaded = uploaded[0].download(workspace.path("copy"))?;
    assert_eq!(downloaded.commit_ids()?, original.commit_ids()?);
    for commit in &commits {
        let left = workspace.path("left");
        let right = workspace.path("right");
        original.checkout(&commit.id, &left)?;
        downloaded.checkout(&commit.id, &right)?;
        assert_eq!(read_tree(&left)?, read_tree(&right)?);
        assert_eq!(original.snapshot(&commit.id)?, downloaded.snapshot(&commit.id)?);
    }

    Ok(())
}

#[test]
fn download_refuses_non_empty_destination() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let remote = workspace.path("remote");
    let mut engine = workspace.engine("store")?.with_remote(FolderSetCollection::new(
        &remote,
        false,
        Git2Backend::new(),
    ));
    engine.build_set("s1", &commits)?;
    let uploaded = engine.upload_all()?;

    let destination = workspace.path("copy");
    fs::create_dir_all(&destination)?;
    fs::write(destination.join("occupied"), "")?;

    let result = uploaded[0].download(&destination);
    assert!(matches!(result, Err(SetError::DestinationExists { .. })));
    assert_eq!(fs::read_dir(&destination)?.count(), 1);

    Ok(())
}

#[test]
fn conflicting_upload_names_never_overwrite() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "2"])?;
    let remote = workspace.path("remote");
    let collection = FolderSetCollection::new(&remote, false, Git2Backend::new());

    let mut first = workspace.engine("first")?;
    let mut second = workspace.engine("second")?;
    let one = first.build_set("nightly", &commits[..1])?;
    let two = second.build_set("nightly", &commits)?;

    collection.upload(&one)?;
    collection.upload(&two)?;

    let names = collection
        .sets()?
        .iter()
        .map(|set| set.name())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["nightly".to_string(), "nightly-2".to_string()]);
    assert_eq!(collection.sets()?[0].commit_ids()?.len(), 1);

    Ok(())
}

#[test]
fn remote_sets_are_downloaded_once() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let remote = workspace.path("remote");

    let mut publisher = workspace.engine("publisher")?.with_remote(FolderSetCollection::new(
        &remote,
        false,
        Git2Backend::new(),
    ));
    publisher.build_set("s1", &commits)?;
    publisher.upload_all()?;

    let consumer = workspace.engine("consumer")?.with_remote(FolderSetCollection::new(
        &remote,
        true,
        Git2Backend::new(),
    ));
    assert!(consumer.store().sets()?.is_empty());

    let found = consumer.resolve(&commits[0].id)?;
    assert_eq!(found.location(), consumer.store().sets_dir().join("s1"));

    let again = consumer.resolve(&commits[0].id)?;
    assert_eq!(again.location(), found.location());
    assert_eq!(consumer.store().sets()?.len(), 1);

    let target = consumer.checkout(&commits[0].id, Some(workspace.path("out").as_path()))?;
    assert_eq!(fs::read_to_string(target.join("out.txt"))?, "1");

    Ok(())
}

#[test]
fn local_sets_win_over_remote_sets() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let remote = workspace.path("remote");

    let mut publisher = workspace.engine("publisher")?.with_remote(FolderSetCollection::new(
        &remote,
        false,
        Git2Backend::new(),
    ));
    publisher.build_set("shared", &commits)?;
    publisher.upload_all()?;

    let mut consumer = workspace.engine("consumer")?.with_remote(FolderSetCollection::new(
        &remote,
        true,
        Git2Backend::new(),
    ));
    consumer.build_set("mine", &commits)?;

    assert_eq!(consumer.resolve(&commits[0].id)?.name(), "mine");
    assert_eq!(consumer.store().sets()?.len(), 1);

    Ok(())
}

#[test]
fn local_resolution_follows_name_order() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let mut engine = workspace.engine("store")?;
    engine.build_set("zeta", &commits)?;
    engine.build_set("alpha", &commits)?;
    engine.build_set("mid", &commits)?;

    assert_eq!(engine.resolve(&commits[0].id)?.name(), "alpha");

    let names = engine
        .status()?
        .local
        .into_iter()
        .map(|set| set.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);

    Ok(())
}

#[test]
fn interrupted_run_leaves_no_set() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let mut engine = workspace.engine("store")?;

    // Work tree abandoned before finalize, as a crash would leave it.
    let mut worktree = engine.store().new_worktree("s1")?;
    worktree.commit_snapshot(
        None,
        "partial",
        &commits[0].author,
        commits[0].time,
        &commits[0].id,
        &Default::default(),
    )?;
    drop(worktree);

    assert!(engine.store().set("s1")?.is_none());
    assert!(engine.resolve(&commits[0].id).is_err());
    assert_eq!(engine.store().prune_worktrees()?, vec!["s1".to_string()]);

    // Aborted run cleans up its own work tree.
    let mut broken = commits.clone();
    broken.push(bogus_commit());
    let result = engine.build_set("s1", &broken);
    assert!(matches!(result, Err(EngineError::Source(_))));
    assert!(engine.store().set("s1")?.is_none());
    assert!(!engine.store().worktree_path("s1")?.exists());

    engine.build_set("s1", &commits)?;
    assert!(engine.store().set("s1")?.is_some());

    Ok(())
}

#[test]
fn source_is_restored_after_run() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "fail", "3", "4"])?;
    let source = workspace.source.path();
    fs::write(source.join("value.txt"), "uncommitted")?;
    fs::write(source.join("untracked.txt"), "untracked")?;

    let mut engine = workspace.engine("store")?;
    engine.build_set("s1", &commits[..3])?;

    assert_eq!(workspace.source.head_name()?, "refs/heads/main");
    assert_eq!(fs::read_to_string(source.join("value.txt"))?, "uncommitted");
    assert_eq!(fs::read_to_string(source.join("untracked.txt"))?, "untracked");
    assert!(!source.join("build").exists());

    Ok(())
}

#[test]
fn detached_head_and_index_are_restored() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "2", "fail", "4"])?;
    let source = workspace.source.path();

    // INVARIANT: Detach at a middle commit, then stage one file and dirty another.
    let repo = Repository::open(source)?;
    repo.set_head_detached(Oid::from_str(&commits[1].id)?)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
    fs::write(source.join("staged.txt"), "staged")?;
    let mut index = repo.index()?;
    index.add_path(Path::new("staged.txt"))?;
    index.write()?;
    fs::write(source.join("value.txt"), "dirty")?;

    let before = repo_state(source)?;
    assert!(before.0);
    assert_eq!(
        before.2,
        vec![
            ("staged.txt".to_string(), Status::INDEX_NEW),
            ("value.txt".to_string(), Status::WT_MODIFIED),
        ]
    );

    let mut engine = workspace.engine("store")?;
    engine.build_set("s1", &commits)?;

    assert_eq!(repo_state(source)?, before);
    assert_eq!(fs::read_to_string(source.join("value.txt"))?, "dirty");
    assert!(!source.join("build").exists());

    Ok(())
}

#[test]
fn source_is_restored_after_failures() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["fail", "fail"])?;
    let source = workspace.source.path();
    fs::write(source.join("value.txt"), "uncommitted")?;

    let mut engine = workspace.engine("store")?;
    let set = engine.build_set("s1", &commits)?;
    assert!(set
        .commit_ids()?
        .iter()
        .all(|id| !set.snapshot(id).map(|s| s.valid).unwrap_or(true)));
    assert_eq!(workspace.source.head_name()?, "refs/heads/main");
    assert_eq!(fs::read_to_string(source.join("value.txt"))?, "uncommitted");

    let mut broken = commits.clone();
    broken.insert(1, bogus_commit());
    assert!(engine.build_set("s2", &broken).is_err());
    assert_eq!(workspace.source.head_name()?, "refs/heads/main");
    assert_eq!(fs::read_to_string(source.join("value.txt"))?, "uncommitted");

    Ok(())
}

#[test]
fn panicking_derivation_is_recorded_invalid() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "2"])?;
    let mut calls = 0;
    let deriver = move |_: &Path, notes: &mut Notes| -> derive::Result<PathBuf> {
        calls += 1;
        notes.insert("attempt".into(), json!(calls));
        panic!("derivation blew up");
    };
    let mut engine = workspace.engine_with("store", deriver)?;

    let set = engine.build_set("s1", &commits)?;
    let snapshot = set.snapshot(&commits[1].id)?;
    assert!(!snapshot.valid);
    assert_eq!(snapshot.notes.get("attempt"), Some(&json!(2)));
    assert_eq!(workspace.source.head_name()?, "refs/heads/main");

    Ok(())
}

#[test]
fn readonly_collections_never_receive_uploads() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let readonly = workspace.path("readonly");
    let writable = workspace.path("writable");

    let mut engine = workspace.engine("store")?.with_remote(FolderSetCollection::new(
        &readonly,
        true,
        Git2Backend::new(),
    ));
    engine.build_set("s1", &commits)?;
    assert!(matches!(engine.upload_all(), Err(EngineError::NoWritableRemote)));
    assert!(!readonly.exists());

    let engine = engine.with_remote(FolderSetCollection::new(&writable, false, Git2Backend::new()));
    assert_eq!(engine.upload_all()?.len(), 1);
    assert!(!readonly.exists());
    assert!(writable.join("s1").exists());

    let collection = FolderSetCollection::new(&readonly, true, Git2Backend::new());
    let set = engine.store().set("s1")?.unwrap();
    assert!(matches!(
        collection.upload(&set),
        Err(SetError::ReadonlyCollection { .. })
    ));

    Ok(())
}

#[test]
fn status_reports_remote_collections() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1", "2"])?;
    let remote = workspace.path("remote");
    let mut engine = workspace.engine("store")?.with_remote(FolderSetCollection::new(
        &remote,
        false,
        Git2Backend::new(),
    ));
    engine.build_set("s1", &commits)?;
    engine.upload_all()?;

    let status = engine.status()?;
    assert_eq!(status.local.len(), 1);
    assert_eq!(status.remotes.len(), 1);
    assert!(!status.remotes[0].readonly);
    assert_eq!(status.remotes[0].sets, status.local);

    Ok(())
}

#[test]
fn empty_sets_are_uploaded_once() -> Result<()> {
    let workspace = Workspace::new()?;
    let remote = workspace.path("remote");
    let mut engine = workspace.engine("store")?.with_remote(FolderSetCollection::new(
        &remote,
        false,
        Git2Backend::new(),
    ));
    let set = engine.build_set("empty", &[])?;
    assert_eq!(set.tip()?, None);

    assert_eq!(engine.upload_all()?.len(), 1);
    assert_eq!(engine.upload_all()?.len(), 0);
    assert_eq!(engine.upload_all()?.len(), 0);

    let names = engine.remotes()[0]
        .sets()?
        .iter()
        .map(|set| set.name())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["empty".to_string()]);

    Ok(())
}

#[test]
fn failed_checkout_leaves_target_untouched() -> Result<()> {
    let workspace = Workspace::new()?;
    let commits = workspace.commits(&["1"])?;
    let mut engine = workspace.engine("store")?;
    let set = engine.build_set("s1", &commits)?;

    // INVARIANT: Strip the note, so the snapshot can no longer be described.
    let repo = Repository::open(set.location())?;
    let signature = Signature::now("John Doe", "john@doe.com")?;
    let tip = set.tip()?.unwrap_or_default();
    repo.note_delete(Oid::from_str(&tip)?, None, &signature, &signature)?;

    let target = workspace.path("out");
    fs::create_dir_all(&target)?;
    fs::write(target.join("keep"), "keep")?;

    let result = engine.checkout(&commits[0].id, Some(target.as_path()));
    assert!(matches!(
        result,
        Err(EngineError::Set(SetError::MissingMetadata { .. }))
    ));
    assert_eq!(fs::read_to_string(target.join("keep"))?, "keep");
    assert_eq!(read_tree(&target)?.len(), 1);

    Ok(())
}
