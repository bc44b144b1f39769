// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for configuration files that glint uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! Glint reads two files from its configuration directory:
//!
//! 1. `settings.toml` which tunes the sync pipeline, i.e., debounce window,
//!    pull interval, noise patterns, and the SSH identity handed to Git.
//! 2. `directories.toml` which lists every monitored directory in the order
//!    the user added them. Glint writes this file back whenever the monitored
//!    set changes.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Sync pipeline settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds to collect filesystem events before flushing them as a batch.
    pub debounce_secs: u64,

    /// Seconds between periodic pulls of every monitored directory.
    pub pull_interval_secs: u64,

    /// Wall-clock drift in seconds that counts as a wake from sleep.
    pub wake_threshold_secs: u64,

    /// Gitignore-style patterns of editor noise to drop before aggregation.
    pub ignore: Vec<String>,

    /// Identity to hand to SSH when talking to remotes.
    pub ssh: Option<SshIdentity>,
}

impl Settings {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    pub fn wake_threshold(&self) -> Duration {
        Duration::from_secs(self.wake_threshold_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debounce_secs: 10,
            pull_interval_secs: 300,
            wake_threshold_secs: 30,
            ignore: vec![
                "*.swp".into(),
                "*.swx".into(),
                "*~".into(),
                ".#*".into(),
                "*.zim-new~".into(),
                "4913".into(),
            ],
            ssh: None,
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data)?;

        // INVARIANT: Periodic pull and wake detection need a non-zero period.
        if settings.pull_interval_secs == 0 {
            return Err(ConfigError::ZeroSetting("pull_interval_secs"));
        }
        if settings.wake_threshold_secs == 0 {
            return Err(ConfigError::ZeroSetting("wake_threshold_secs"));
        }

        // INVARIANT: Perform shell expansion on SSH identity paths.
        if let Some(ssh) = settings.ssh.as_mut() {
            ssh.private_key = expand_path(&ssh.private_key)?;
            ssh.known_hosts = expand_path(&ssh.known_hosts)?;
        }

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// SSH identity used for remote transport.
///
/// Glint treats this opaquely. It neither generates nor validates the keys,
/// it only points SSH at them.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SshIdentity {
    /// Private key file passed to `ssh -i`.
    pub private_key: PathBuf,

    /// Known hosts file that SSH should trust exclusively.
    pub known_hosts: PathBuf,
}

/// Persisted listing of monitored directories.
///
/// Order of entries is the order the user added them, which is also the
/// order glint iterates them in.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct DirectoryList {
    #[serde(rename = "directory", default)]
    entries: Vec<DirectoryEntry>,
}

impl DirectoryList {
    /// Construct new directory listing from paths.
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            entries: paths
                .into_iter()
                .map(|path| DirectoryEntry { path: path.into() })
                .collect(),
        }
    }

    /// Iterate listed paths in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.entries.iter().map(|entry| entry.path.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for DirectoryList {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut list: DirectoryList = toml::de::from_str(data)?;
        for entry in list.entries.iter_mut() {
            entry.path = expand_path(&entry.path)?;
        }

        Ok(list)
    }
}

impl Display for DirectoryList {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
struct DirectoryEntry {
    path: PathBuf,
}

/// Perform shell expansion on a path, e.g., `~` or `$HOME`.
///
/// # Errors
///
/// - Return [`ConfigError::ShellExpansion`] if an environment variable in the
///   path cannot be resolved.
pub fn expand_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.as_ref().to_string_lossy().as_ref())?.into_owned(),
    ))
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Setting that must be positive was set to zero.
    #[error("setting {0:?} must be greater than zero")]
    ZeroSetting(&'static str),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
