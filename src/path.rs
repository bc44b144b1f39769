// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where glint keeps its settings and the persisted listing of
//! monitored directories.

use std::path::{Path, PathBuf};

/// Determine default absolute path to glint's configuration directory.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/glint` as the default
/// absolute path. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("glint"))
        .ok_or(NoWayHome)
}

/// Path to settings file inside a configuration directory.
pub fn settings_file(config_dir: impl AsRef<Path>) -> PathBuf {
    config_dir.as_ref().join("settings.toml")
}

/// Path to persisted directory listing inside a configuration directory.
pub fn directories_file(config_dir: impl AsRef<Path>) -> PathBuf {
    config_dir.as_ref().join("directories.toml")
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
