// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Noise filtering for raw filesystem events.
//!
//! Not every filesystem mutation is something the user meant to sync. Git
//! rewrites its own metadata directory on every stage and commit we perform,
//! and editors litter swap files next to whatever they have open. Both are
//! implementation noise, so they are dropped before they ever reach the
//! change aggregator.
//!
//! Editor markers are expressed with gitignore syntax, and matched against the
//! file name of each changed path. The version-control metadata directory is
//! matched by path component, so `.gitignore` or `.github/` edits still count
//! as real changes.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Name of the Git metadata directory.
const GIT_DIR: &str = ".git";

/// Decide whether a changed path is noise.
#[derive(Clone, Debug)]
pub struct NoiseFilter {
    markers: Gitignore,
}

impl NoiseFilter {
    /// Construct new noise filter from gitignore-style editor markers.
    ///
    /// # Errors
    ///
    /// - Return [`ignore::Error`] if any marker is not a valid glob.
    pub fn new(markers: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self, ignore::Error> {
        let mut builder = GitignoreBuilder::new("");
        for marker in markers {
            builder.add_line(None, marker.as_ref())?;
        }

        Ok(Self {
            markers: builder.build()?,
        })
    }

    /// Check if path is noise that should never trigger a sync.
    pub fn is_noise(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if path.components().any(|part| part.as_os_str() == GIT_DIR) {
            return true;
        }

        match path.file_name() {
            Some(name) => self.markers.matched(Path::new(name), false).is_ignore(),
            None => false,
        }
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self {
            markers: Gitignore::empty(),
        }
    }
}
