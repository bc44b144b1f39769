// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Aggregate sync status.
//!
//! Collapses the per-repository [`SyncState`]s into one idle/syncing signal for
//! presentation layers such as a tray icon. The signal is published on a
//! [`watch`] channel, so observers only ever see the latest value.

use crate::registry::SyncState;

use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tokio::sync::watch;

/// Whether any repository is currently syncing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
}

impl Display for SyncStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Idle => fmt.write_str("idle"),
            Self::Syncing => fmt.write_str("syncing"),
        }
    }
}

/// Derive aggregate status from repository state transitions.
#[derive(Debug)]
pub struct StatusReporter {
    busy: Mutex<HashSet<PathBuf>>,
    sender: watch::Sender<SyncStatus>,
}

impl StatusReporter {
    /// Construct new status reporter in idle status.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SyncStatus::Idle);
        Self {
            busy: Mutex::new(HashSet::new()),
            sender,
        }
    }

    /// Record state transition of a repository.
    ///
    /// Recomputes aggregate status, and notifies observers only if it
    /// actually changed.
    pub fn record(&self, repo: &Path, state: &SyncState) {
        let mut busy = self.busy.lock();
        if state.is_busy() {
            busy.insert(repo.to_path_buf());
        } else {
            busy.remove(repo);
        }

        let status = if busy.is_empty() {
            SyncStatus::Idle
        } else {
            SyncStatus::Syncing
        };

        self.sender.send_if_modified(|current| {
            if *current == status {
                return false;
            }

            *current = status;
            true
        });
    }

    /// Current aggregate status.
    pub fn status(&self) -> SyncStatus {
        *self.sender.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.status() == SyncStatus::Syncing
    }

    /// Observe aggregate status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.sender.subscribe()
    }
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn syncing_while_any_repository_is_busy() {
        let reporter = StatusReporter::new();
        let (a, b) = (Path::new("/a"), Path::new("/b"));
        assert_eq!(reporter.status(), SyncStatus::Idle);

        reporter.record(a, &SyncState::Pushing);
        reporter.record(b, &SyncState::Pulling);
        assert_eq!(reporter.status(), SyncStatus::Syncing);

        reporter.record(a, &SyncState::Idle);
        assert!(reporter.is_syncing());

        reporter.record(b, &SyncState::Error("boom".into()));
        assert_eq!(reporter.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn observers_see_only_real_changes() {
        let reporter = StatusReporter::new();
        let mut observer = reporter.subscribe();

        reporter.record(Path::new("/a"), &SyncState::Pushing);
        assert!(observer.has_changed().unwrap());
        assert_eq!(*observer.borrow_and_update(), SyncStatus::Syncing);

        reporter.record(Path::new("/b"), &SyncState::Pulling);
        assert!(!observer.has_changed().unwrap());

        reporter.record(Path::new("/a"), &SyncState::Idle);
        reporter.record(Path::new("/b"), &SyncState::Idle);
        assert!(observer.has_changed().unwrap());
        assert_eq!(*observer.borrow_and_update(), SyncStatus::Idle);
    }
}
