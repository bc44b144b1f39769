// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version-control backend.
//!
//! The orchestrator never talks to Git directly. Instead it drives a
//! [`Backend`] that knows how to stage, commit, push, pull, and clone a
//! repository given its path. Every backend call blocks, so the orchestrator
//! always dispatches them off the async executor.
//!
//! Results carry diagnostic text on failure, and distinguish the benign
//! "nothing to do" outcomes from real failures:
//!
//! - [`CommitOutcome::NothingToCommit`] when the work tree has no changes.
//! - [`PushOutcome::UpToDate`] when the remote already has every commit.

pub mod git;

pub use git::GitBackend;

use std::path::Path;

/// Layer of indirection for repository operations.
pub trait Backend: Send + Sync + 'static {
    /// Stage every addition, modification, and deletion in the work tree.
    fn stage(&self, repo: &Path) -> Result<()>;

    /// Commit staged changes with message.
    fn commit(&self, repo: &Path, message: &str) -> Result<CommitOutcome>;

    /// Push current branch to its configured remote.
    fn push(&self, repo: &Path) -> Result<PushOutcome>;

    /// Fetch and integrate remote changes into the work tree.
    fn pull(&self, repo: &Path) -> Result<()>;

    /// Clone remote into destination, reporting textual progress.
    fn clone_remote(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(&str)) -> Result<()>;
}

/// Outcome of a successful commit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

/// Outcome of a successful push step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    UpToDate,
}

/// Backend failure with diagnostic text.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// External Git process could not be spawned.
    #[error(transparent)]
    Syscall(#[from] std::io::Error),

    /// External Git process exited with failure.
    #[error("{message}")]
    Command { command: String, message: String },
}

impl BackendError {
    /// Construct command failure from diagnostic text.
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = BackendError> = std::result::Result<T, E>;
