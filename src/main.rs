// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use derivedrepo::{
    config::CONFIG_FILE,
    default_store_dir,
    engine::progress_bar,
    path::{absolute_from, ensure_dir},
    source::short_id,
    Config, DerivationEngine, FolderSetCollection, Git2Backend, LocalStore, ScriptDeriver,
    SnapshotSet, SourceCommit, SourceRepo,
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::{
    env,
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "derivedrepo [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to local store, defaults to current directory.
    #[arg(short, long, global = true, value_name = "path")]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Init(opts) => run_init(self.store, opts),
            Command::Build(opts) => run_build(store_root(self.store)?, opts),
            Command::Extend(opts) => run_extend(store_root(self.store)?, opts),
            Command::Checkout(opts) => run_checkout(store_root(self.store)?, opts),
            Command::Status(opts) => run_status(store_root(self.store)?, opts),
            Command::Remote(opts) => run_remote(store_root(self.store)?, opts),
            Command::Upload => run_upload(store_root(self.store)?),
            Command::Remove(opts) => run_remove(store_root(self.store)?, opts),
            Command::Prune => run_prune(store_root(self.store)?),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Initialize new local store for a source repository.
    #[command(override_usage = "derivedrepo init [options] <source>")]
    Init(InitOptions),

    /// Build new set out of source commits.
    #[command(override_usage = "derivedrepo build [options] <set_name> [<revision>]...")]
    Build(BuildOptions),

    /// Build new set holding an existing set plus more source commits.
    #[command(override_usage = "derivedrepo extend [options] <base> <set_name> [<revision>]...")]
    Extend(ExtendOptions),

    /// Check out snapshot of a source commit.
    #[command(override_usage = "derivedrepo checkout [options] <revision>")]
    Checkout(CheckoutOptions),

    /// Show local sets and remote collections.
    #[command(override_usage = "derivedrepo status [options]")]
    Status(StatusOptions),

    /// Manage remote set collections.
    #[command(subcommand)]
    Remote(RemoteCommand),

    /// Upload local sets to first writable remote collection.
    Upload,

    /// Remove set from local store.
    #[command(override_usage = "derivedrepo remove [options] <set_name>...")]
    Remove(RemoveOptions),

    /// Remove work trees left behind by interrupted builds.
    Prune,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Path to source repository to derive from.
    #[arg(required = true, value_name = "source")]
    pub source: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CommitSelection {
    /// Derive the last N first-parent commits of HEAD.
    #[arg(short, long, value_name = "count", conflicts_with = "revisions")]
    pub last: Option<usize>,

    /// Revisions to derive in order, defaults to HEAD.
    #[arg(value_name = "revision")]
    pub revisions: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BuildOptions {
    /// Name of set to create.
    #[arg(required = true, value_name = "set_name")]
    pub set_name: String,

    #[command(flatten)]
    pub commits: CommitSelection,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ExtendOptions {
    /// Name of set to start from.
    #[arg(required = true, value_name = "base")]
    pub base: String,

    /// Name of set to create.
    #[arg(required = true, value_name = "set_name")]
    pub set_name: String,

    #[command(flatten)]
    pub commits: CommitSelection,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CheckoutOptions {
    /// Source revision to check out snapshot of.
    #[arg(required = true, value_name = "revision")]
    pub revision: String,

    /// Directory to check out into, defaults to store's checkout directory.
    #[arg(short, long, value_name = "path")]
    pub dir: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// List snapshots of every set.
    #[arg(short, long)]
    pub commits: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum RemoteCommand {
    /// Add remote collection to end of search order.
    #[command(override_usage = "derivedrepo remote add [options] <path>")]
    Add(RemoteAddOptions),

    /// Remove remote collection.
    #[command(override_usage = "derivedrepo remote remove [options] <path>")]
    Remove(RemoteRemoveOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoteAddOptions {
    /// Directory holding the collection's sets.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,

    /// Never upload into this collection.
    #[arg(short, long)]
    pub readonly: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoteRemoveOptions {
    /// Directory holding the collection's sets.
    #[arg(required = true, value_name = "path")]
    pub path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveOptions {
    /// Names of sets to remove from local store.
    #[arg(required = true, value_name = "set_name")]
    pub set_names: Vec<String>,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

/// Pick store directory to operate on.
///
/// Falls back to the default store location if the current directory is not
/// a local store itself.
fn store_root(store: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(store) = store {
        return Ok(store);
    }

    let current = env::current_dir()?;
    if current.join(CONFIG_FILE).exists() {
        return Ok(current);
    }

    Ok(default_store_dir()?)
}

fn open_engine(root: &Path) -> Result<DerivationEngine<ScriptDeriver>> {
    let config = Config::load(root.join(CONFIG_FILE))?;
    let backend = Git2Backend::new();
    let store = LocalStore::open(root, backend)?;
    let source = SourceRepo::open(absolute_from(root, config.source_path()?), backend)?;
    let deriver = ScriptDeriver::new(config.derive_path(root)?);

    let mut engine = DerivationEngine::new(store, source, deriver).with_progress(progress_bar()?);
    for entry in config.remote_collections {
        engine = engine.with_remote(FolderSetCollection::new(
            absolute_from(root, entry.path),
            entry.readonly,
            backend,
        ));
    }

    Ok(engine)
}

fn select_commits(
    source: &SourceRepo<Git2Backend>,
    selection: CommitSelection,
) -> Result<Vec<SourceCommit>> {
    let commits = match selection.last {
        Some(count) => source.recent(count)?,
        None if selection.revisions.is_empty() => source.resolve_all(["HEAD"])?,
        None => source.resolve_all(selection.revisions)?,
    };

    Ok(commits)
}

fn run_init(store: Option<PathBuf>, opts: InitOptions) -> Result<()> {
    let root = match store {
        Some(store) => store,
        None => env::current_dir()?,
    };
    ensure_dir(&root)?;

    let source = absolute_from(env::current_dir()?, opts.source);
    SourceRepo::open(&source, Git2Backend::new())?;
    Config::init(&root, source)?;
    LocalStore::open(&root, Git2Backend::new())?;

    Ok(())
}

fn run_build(root: PathBuf, opts: BuildOptions) -> Result<()> {
    let mut engine = open_engine(&root)?;
    let commits = select_commits(engine.source(), opts.commits)?;
    engine.build_set(&opts.set_name, &commits)?;

    Ok(())
}

fn run_extend(root: PathBuf, opts: ExtendOptions) -> Result<()> {
    let mut engine = open_engine(&root)?;
    let commits = select_commits(engine.source(), opts.commits)?;
    engine.extend_set(&opts.base, &opts.set_name, &commits)?;

    Ok(())
}

fn run_checkout(root: PathBuf, opts: CheckoutOptions) -> Result<()> {
    let engine = open_engine(&root)?;

    // INVARIANT: Snapshots are tagged by full commit id, so expand short revisions.
    let id = match engine.source().resolve(&opts.revision) {
        Ok(commit) => commit.id,
        Err(_) => opts.revision,
    };
    let target = engine.checkout(&id, opts.dir.as_deref())?;
    println!("{}", target.display());

    Ok(())
}

fn run_status(root: PathBuf, opts: StatusOptions) -> Result<()> {
    let engine = open_engine(&root)?;
    let status = engine.status()?;

    println!("local sets in {:?}:", engine.store().sets_dir().display());
    for set in &status.local {
        println!("  {} ({} snapshots)", set.name, set.commits.len());
        if !opts.commits {
            continue;
        }

        let local = engine
            .store()
            .set(&set.name)?
            .ok_or_else(|| anyhow!("set {:?} vanished", set.name))?;
        for id in &set.commits {
            let valid = local.snapshot(id)?.valid;
            let summary = engine
                .source()
                .resolve(id)
                .map(|commit| commit.summary)
                .unwrap_or_default();
            let marker = if valid { "" } else { " [invalid]" };
            println!("    {} {summary}{marker}", short_id(id));
        }
    }

    for remote in &status.remotes {
        let kind = if remote.readonly { "readonly" } else { "writable" };
        println!("remote collection {:?} ({kind}):", remote.identifier);
        for set in &remote.sets {
            println!("  {} ({} snapshots)", set.name, set.commits.len());
        }
    }

    Ok(())
}

fn run_remote(root: PathBuf, command: RemoteCommand) -> Result<()> {
    let path = root.join(CONFIG_FILE);
    let mut config = Config::load(&path)?;
    match command {
        RemoteCommand::Add(opts) => {
            let remote = absolute_from(env::current_dir()?, opts.path);
            if !config.add_remote(&remote, opts.readonly) {
                return Err(anyhow!("remote collection {:?} already listed", remote.display()));
            }
            info!("added remote collection {:?}", remote.display());
        }
        RemoteCommand::Remove(opts) => {
            let remote = absolute_from(env::current_dir()?, opts.path);
            if !config.remove_remote(&remote) {
                return Err(anyhow!("remote collection {:?} not listed", remote.display()));
            }
            info!("removed remote collection {:?}", remote.display());
        }
    }
    config.save(path)?;

    Ok(())
}

fn run_upload(root: PathBuf) -> Result<()> {
    let engine = open_engine(&root)?;
    for set in engine.upload_all()? {
        println!("{}", set.identifier());
    }

    Ok(())
}

fn run_remove(root: PathBuf, opts: RemoveOptions) -> Result<()> {
    let store = LocalStore::open(&root, Git2Backend::new())?;
    for set_name in opts.set_names {
        store.remove_set(&set_name)?;
    }

    Ok(())
}

fn run_prune(root: PathBuf) -> Result<()> {
    let store = LocalStore::open(&root, Git2Backend::new())?;
    for name in store.prune_worktrees()? {
        println!("{name}");
    }

    Ok(())
}
