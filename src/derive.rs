// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Derivation callbacks.
//!
//! A __derivation__ computes the content of a snapshot from a checked out
//! source commit, e.g., by running a build. It is supplied by the user, and
//! may fail in any way it likes: returning an error, producing no output
//! directory, or even panicking. All of these mean the same thing, that the
//! commit could not be derived, and get recorded as an invalid snapshot.
//!
//! Derivations can attach arbitrary JSON values as __custom notes__. Notes
//! written before a failure are kept.

use crate::path::absolute_from;

use std::{
    any::Any,
    ffi::OsString,
    fs,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};
use tracing::{debug, warn};

/// Environment variable naming the file a derive script writes notes to.
pub const NOTES_ENV: &str = "DERIVEDREPO_NOTES";

/// Custom notes produced by a derivation.
pub type Notes = serde_json::Map<String, serde_json::Value>;

/// Capability to derive snapshot content from a source checkout.
pub trait Derive {
    /// Derive output for the commit currently checked out at `source`.
    ///
    /// Returns the directory holding the derived output. Relative paths are
    /// taken relative to `source`.
    ///
    /// # Errors
    ///
    /// - Return any [`DerivationError`] if the commit cannot be derived.
    fn derive(&mut self, source: &Path, notes: &mut Notes) -> Result<PathBuf>;
}

impl<F> Derive for F
where
    F: FnMut(&Path, &mut Notes) -> Result<PathBuf>,
{
    fn derive(&mut self, source: &Path, notes: &mut Notes) -> Result<PathBuf> {
        self(source, notes)
    }
}

/// Run derivation, turning every way it can fail into an error.
///
/// Panics are caught. Output paths are resolved against `source`, and must
/// name an existing directory.
pub(crate) fn derive_guarded<D: Derive>(
    deriver: &mut D,
    source: &Path,
    notes: &mut Notes,
) -> Result<PathBuf> {
    let output = catch_unwind(AssertUnwindSafe(|| deriver.derive(source, notes)))
        .map_err(|payload| DerivationError::Panicked(panic_message(payload.as_ref())))??;

    let output = absolute_from(source, output);
    if !output.is_dir() {
        debug!("derived output {:?} is not a directory", output.display());
        return Err(DerivationError::NoOutput);
    }

    Ok(output)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }

    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }

    "unknown panic".into()
}

/// Derivation through an external executable script.
///
/// The script is run with the source checkout as its working directory and
/// sole argument. It reports its output directory as the last non-empty line
/// of standard output, and may write a JSON object of custom notes into the
/// file named by [`NOTES_ENV`]. Standard error is passed through untouched, so
/// build logs stay visible.
#[derive(Debug, Clone)]
pub struct ScriptDeriver {
    script: PathBuf,
}

impl ScriptDeriver {
    /// Construct new script deriver.
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }

    /// Path to the derive script.
    pub fn script(&self) -> &Path {
        &self.script
    }

    fn read_notes(&self, file: &Path, notes: &mut Notes) {
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(err) => {
                warn!("cannot read notes of {:?}: {err}", self.script.display());
                return;
            }
        };

        if content.trim().is_empty() {
            return;
        }

        match serde_json::from_str::<Notes>(&content) {
            Ok(data) => notes.extend(data),
            Err(err) => warn!("ignore malformed notes of {:?}: {err}", self.script.display()),
        }
    }
}

impl Derive for ScriptDeriver {
    fn derive(&mut self, source: &Path, notes: &mut Notes) -> Result<PathBuf> {
        let notes_file = tempfile::NamedTempFile::new()?;
        let output = Command::new(&self.script)
            .arg(source)
            .current_dir(source)
            .env(NOTES_ENV, notes_file.path())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|err| DerivationError::Spawn {
                source: err,
                script: self.script.clone(),
            })?;

        // INVARIANT: Notes count even when the script fails.
        self.read_notes(notes_file.path(), notes);

        if !output.status.success() {
            return Err(DerivationError::Script {
                script: self.script.clone(),
                status: output.status,
            });
        }

        let stdout = String::from_utf8_lossy(output.stdout.as_slice());
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| PathBuf::from(OsString::from(line)))
            .ok_or(DerivationError::NoOutput)
    }
}

/// Derivation failure types.
///
/// None of these ever abort a run. They only mark a snapshot as invalid.
#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    /// Derivation produced no output directory.
    #[error("derivation produced no output directory")]
    NoOutput,

    /// Derivation reported failure.
    #[error("derivation failed: {0}")]
    Failed(String),

    /// Derivation panicked.
    #[error("derivation panicked: {0}")]
    Panicked(String),

    /// Derive script cannot be started.
    #[error("failed to run derive script {:?}", script.display())]
    Spawn {
        #[source]
        source: std::io::Error,
        script: PathBuf,
    },

    /// Derive script exited unsuccessfully.
    #[error("derive script {:?} exited with {status}", script.display())]
    Script { script: PathBuf, status: ExitStatus },

    /// I/O needed by the derivation fails.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = DerivationError> = std::result::Result<T, E>;
