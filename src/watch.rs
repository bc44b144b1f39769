// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Recursive watching of monitored directories.
//!
//! The path watcher wraps the operating system's recursive change
//! notification facility through [`notify`]. It reports every create, modify,
//! delete, or rename under any of its roots as a raw [`ChangeEvent`], after
//! dropping noise through a [`NoiseFilter`]. No coalescing happens here, that
//! is the job of the change aggregator.
//!
//! Notifications are delivered on notify's own background thread, and handed
//! to the async side of glint through a bounded channel.

pub mod filter;

pub use filter::NoiseFilter;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

/// Capacity of raw event channel between notify and the aggregator.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A single raw change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Absolute path that changed.
    pub path: PathBuf,

    /// When the event arrived.
    pub timestamp: Instant,
}

impl ChangeEvent {
    /// Construct new change event stamped with the current time.
    pub fn now(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timestamp: Instant::now(),
        }
    }
}

/// Recursive watcher over a replaceable set of roots.
pub struct PathWatcher {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl PathWatcher {
    /// Construct new path watcher that sends raw events through `sender`.
    ///
    /// Starts out watching nothing. Use [`PathWatcher::replace_roots`] to
    /// begin watching.
    ///
    /// # Errors
    ///
    /// - Return [`WatchError::InitFailed`] if the OS watch facility cannot be
    ///   initialized.
    pub fn new(filter: NoiseFilter, sender: mpsc::Sender<ChangeEvent>) -> Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_mutation(&event.kind) {
                    return;
                }

                for path in event.paths {
                    if filter.is_noise(&path) {
                        continue;
                    }

                    // INVARIANT: Receiver gone means the pipeline is shutting down.
                    if sender.blocking_send(ChangeEvent::now(path)).is_err() {
                        return;
                    }
                }
            }
            Err(error) => warn!("file watch error: {error}"),
        })?;

        Ok(Self {
            watcher,
            roots: Vec::new(),
        })
    }

    /// Replace the set of watched roots.
    ///
    /// Tears down the watch on every current root, then watches each new root
    /// recursively. A root that cannot be watched is skipped while the
    /// remaining roots are still watched. Returns the failures for the caller
    /// to report.
    pub fn replace_roots(
        &mut self,
        roots: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Vec<WatchError> {
        for root in self.roots.drain(..) {
            if let Err(error) = self.watcher.unwatch(&root) {
                debug!("unwatch {}: {error}", root.display());
            }
        }

        let mut failures = Vec::new();
        for root in roots.into_iter().map(Into::into) {
            match self.watcher.watch(&root, RecursiveMode::Recursive) {
                Ok(()) => {
                    info!("watching {}", root.display());
                    self.roots.push(root);
                }
                Err(error) => {
                    let failure = WatchError::PathWatchFailed {
                        path: root,
                        reason: error.to_string(),
                    };
                    warn!("{failure}");
                    failures.push(failure);
                }
            }
        }

        failures
    }

    /// Roots currently being watched successfully.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Check if root is currently being watched.
    pub fn is_watching(&self, root: impl AsRef<Path>) -> bool {
        self.roots.iter().any(|path| path == root.as_ref())
    }
}

fn is_mutation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Errors from watcher operations.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// OS watch facility could not be initialized.
    #[error("failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    /// A single root could not be watched.
    #[error("cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },
}

impl From<notify::Error> for WatchError {
    fn from(error: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: error.to_string(),
        }
    }
}

/// Friendly result alias :3
type Result<T, E = WatchError> = std::result::Result<T, E>;
