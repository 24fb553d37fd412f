// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Every local store carries a small JSON configuration file at its top-level
//! named "config.json". It names the source repository to derive from, the
//! derive script to run, and the remote set collections to search and
//! publish to.
//!
//! # General Layout
//!
//! ```json
//! {
//!   "sourcePath": "~/projects/engine",
//!   "derivePath": "derive.sh",
//!   "remoteCollections": [
//!     { "path": "/mnt/share/engine-builds", "readonly": false }
//!   ]
//! }
//! ```
//!
//! All paths undergo shell expansion when loaded. A relative derive path is
//! taken relative to the store directory. Remote collections are searched in
//! the order they are listed.

use crate::path::{absolute_from, ensure_dir, is_dir_empty_ignoring_hidden};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, instrument};

/// Name of configuration file inside a local store.
pub const CONFIG_FILE: &str = "config.json";

/// Name of derive script template written by [`Config::init`].
pub const DERIVE_TEMPLATE_FILE: &str = "derive.sh";

const DERIVE_TEMPLATE: &str = r#"#!/bin/sh
# Derive output for the source commit checked out in the current directory.
#
# Print the output directory as the last line of standard output. Write a
# JSON object to "$DERIVEDREPO_NOTES" to attach custom notes to the snapshot.
# Exit with a non-zero status if the commit cannot be derived.
exit 1
"#;

/// Local store configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the source repository.
    #[serde(default)]
    pub source_path: Option<PathBuf>,

    /// Path to the derive script.
    #[serde(default)]
    pub derive_path: Option<PathBuf>,

    /// Remote set collections in search order.
    #[serde(default)]
    pub remote_collections: Vec<RemoteCollectionEntry>,
}

impl Config {
    /// Load configuration file.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file content is malformed.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no configuration at {:?}, using defaults", path.display());
            return Ok(Self::default());
        }

        fs::read_to_string(path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            })?
            .parse()
    }

    /// Save configuration file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Write`] if file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        fs::write(path, self.to_string()).map_err(|err| ConfigError::Write {
            source: err,
            path: path.to_path_buf(),
        })
    }

    /// Initialize configuration for a new local store.
    ///
    /// Writes the configuration file pointing at the source repository, and
    /// an executable derive script template for the user to fill in.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NotEmpty`] if store directory already holds
    ///   anything besides hidden entries.
    /// - Return [`ConfigError::Write`] if any file cannot be written.
    #[instrument(skip(root, source), level = "debug")]
    pub fn init(root: impl AsRef<Path>, source: impl Into<PathBuf>) -> Result<Self> {
        let root = root.as_ref();
        if !is_dir_empty_ignoring_hidden(root)? {
            return Err(ConfigError::NotEmpty {
                path: root.to_path_buf(),
            });
        }

        let config = Self {
            source_path: Some(source.into()),
            derive_path: Some(PathBuf::from(DERIVE_TEMPLATE_FILE)),
            remote_collections: Vec::new(),
        };
        config.save(root.join(CONFIG_FILE))?;

        let script = root.join(DERIVE_TEMPLATE_FILE);
        fs::write(&script, DERIVE_TEMPLATE).map_err(|err| ConfigError::Write {
            source: err,
            path: script.clone(),
        })?;
        make_executable(&script)?;
        info!("initialized store at {:?}", root.display());

        Ok(config)
    }

    /// Path to source repository.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingSourcePath`] if not configured.
    pub fn source_path(&self) -> Result<&Path> {
        self.source_path
            .as_deref()
            .ok_or(ConfigError::MissingSourcePath)
    }

    /// Absolute path to derive script, relative paths resolved against root.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingDerivePath`] if not configured.
    pub fn derive_path(&self, root: impl AsRef<Path>) -> Result<PathBuf> {
        self.derive_path
            .as_deref()
            .map(|path| absolute_from(root, path))
            .ok_or(ConfigError::MissingDerivePath)
    }

    /// Add remote collection to the end of the search order.
    ///
    /// Returns `false` if the collection was already listed.
    pub fn add_remote(&mut self, path: impl Into<PathBuf>, readonly: bool) -> bool {
        let path = path.into();
        if self.remote_collections.iter().any(|entry| entry.path == path) {
            return false;
        }

        self.remote_collections
            .push(RemoteCollectionEntry { path, readonly });
        true
    }

    /// Remove remote collection.
    ///
    /// Returns `false` if the collection was not listed.
    pub fn remove_remote(&mut self, path: impl AsRef<Path>) -> bool {
        let before = self.remote_collections.len();
        self.remote_collections
            .retain(|entry| entry.path != path.as_ref());
        before != self.remote_collections.len()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = serde_json::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        config.source_path = config.source_path.map(expand).transpose()?;
        config.derive_path = config.derive_path.map(expand).transpose()?;
        for entry in &mut config.remote_collections {
            entry.path = expand(std::mem::take(&mut entry.path))?;
        }

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let mut data = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        data.push('\n');
        fmt.write_str(data.as_str())
    }
}

/// Remote set collection listed in configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RemoteCollectionEntry {
    /// Directory holding the collection's sets.
    pub path: PathBuf,

    /// Whether uploads into the collection are forbidden.
    #[serde(default)]
    pub readonly: bool,
}

fn expand(path: PathBuf) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|err| {
        ConfigError::Write {
            source: err,
            path: path.to_path_buf(),
        }
    })
}

#[cfg(not(unix))]
fn make_executable(_: &Path) -> Result<()> {
    Ok(())
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error("failed to deserialize configuration")]
    Deserialize(#[source] serde_json::Error),

    /// Failed to serialize configuration.
    #[error("failed to serialize configuration")]
    Serialize(#[source] serde_json::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Configuration file cannot be read.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file or template cannot be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Store directory to initialize is not empty.
    #[error("directory {:?} is not empty", path.display())]
    NotEmpty { path: PathBuf },

    /// Source repository path is not configured.
    #[error("configuration names no source repository")]
    MissingSourcePath,

    /// Derive script path is not configured.
    #[error("configuration names no derive script")]
    MissingDerivePath,

    /// Directory utility fails.
    #[error(transparent)]
    Path(#[from] crate::path::Error),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
