// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository registry.
//!
//! The registry is the authoritative listing of __monitored directories__,
//! i.e., local directories the user opted into syncing, together with one
//! [`RepositoryHandle`] per directory. Handles are cheap value holders that
//! bind a directory to its sync state. They are not live connections to a
//! repository, so callers may clone and hold on to them freely.
//!
//! # Ordering
//!
//! Directories keep insertion order. That order is the iteration order for
//! listing, fan-out, and the order in which change batches are emitted.
//!
//! # Routing
//!
//! A changed path belongs to every monitored directory that is a path prefix
//! of it. Prefix matching is done by path component, so `/a/foo` does not own
//! `/a/foobar/x`. Nested monitored directories therefore both receive the
//! change. [`Registry::resolve`] answers the narrower question of which single
//! directory is the closest owner of a path.
//!
//! # Handle Maintenance
//!
//! Mutation patches only the delta, keyed by path. Handles of directories
//! that stay registered keep their sync state across unrelated additions and
//! removals, so an in-flight sequence can never be duplicated by a rebuild.

use parking_lot::Mutex;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

/// Per-repository sync state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Error(String),
}

impl SyncState {
    /// Check if state represents an in-flight sequence.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Pushing | Self::Pulling)
    }
}

impl Display for SyncState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Idle => fmt.write_str("idle"),
            Self::Pushing => fmt.write_str("pushing"),
            Self::Pulling => fmt.write_str("pulling"),
            Self::Error(message) => write!(fmt, "error: {message}"),
        }
    }
}

/// Kind of sync sequence run against a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Push,
    Pull,
}

impl Operation {
    fn busy_state(self) -> SyncState {
        match self {
            Self::Push => SyncState::Pushing,
            Self::Pull => SyncState::Pulling,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Push => fmt.write_str("push"),
            Self::Pull => fmt.write_str("pull"),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: SyncState,
    last_error: Option<String>,
}

/// Sync-capable binding of a monitored directory to its remote.
#[derive(Debug, Clone)]
pub struct RepositoryHandle {
    path: PathBuf,
    slot: Arc<Mutex<Slot>>,
}

impl RepositoryHandle {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Path of monitored directory, which is also the repository's work tree.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current sync state.
    pub fn state(&self) -> SyncState {
        self.slot.lock().state.clone()
    }

    /// Diagnostic text of the most recent failed sequence, if any.
    pub fn last_error(&self) -> Option<String> {
        self.slot.lock().last_error.clone()
    }

    /// Check if path falls under this handle's directory.
    pub fn owns(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().starts_with(&self.path)
    }

    /// Begin a sequence if and only if the repository is idle.
    ///
    /// The check and the transition happen under one lock, so two callers can
    /// never both start a sequence on the same repository.
    ///
    /// # Errors
    ///
    /// - Return the current [`SyncState`] if the repository is not idle.
    pub(crate) fn try_begin(&self, operation: Operation) -> Result<SyncState, SyncState> {
        let mut slot = self.slot.lock();
        if slot.state != SyncState::Idle {
            return Err(slot.state.clone());
        }

        slot.state = operation.busy_state();
        Ok(slot.state.clone())
    }

    /// Record failure of the in-flight sequence.
    pub(crate) fn fail(&self, message: impl Into<String>) -> SyncState {
        let message = message.into();
        let mut slot = self.slot.lock();
        slot.last_error = Some(message.clone());
        slot.state = SyncState::Error(message);
        slot.state.clone()
    }

    /// Return repository to idle.
    pub(crate) fn settle(&self) -> SyncState {
        let mut slot = self.slot.lock();
        slot.state = SyncState::Idle;
        slot.state.clone()
    }
}

impl PartialEq for RepositoryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for RepositoryHandle {}

/// Authoritative listing of monitored directories and their handles.
#[derive(Debug, Default)]
pub struct Registry {
    handles: Vec<RepositoryHandle>,
}

impl Registry {
    /// Construct new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct registry from persisted directory listing.
    ///
    /// Invalid or duplicate entries are skipped with a warning instead of
    /// rejecting the entire listing.
    pub fn from_paths(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        let mut registry = Self::new();
        for path in paths {
            if let Err(error) = registry.add(path) {
                warn!("skip monitored directory: {error}");
            }
        }

        registry
    }

    /// Register a new monitored directory.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NotAbsolute`] if path is relative.
    /// - Return [`RegistryError::Duplicate`] if path is already registered.
    pub fn add(&mut self, path: impl Into<PathBuf>) -> Result<RepositoryHandle> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(RegistryError::NotAbsolute(path));
        }

        if self.get(&path).is_some() {
            return Err(RegistryError::Duplicate(path));
        }

        debug!("register {}", path.display());
        let handle = RepositoryHandle::new(path);
        self.handles.push(handle.clone());

        Ok(handle)
    }

    /// Unregister a monitored directory.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NotFound`] if path is not registered.
    /// - Return [`RegistryError::Busy`] if a sequence is still in flight.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> Result<RepositoryHandle> {
        let path = path.as_ref();
        let index = self
            .handles
            .iter()
            .position(|handle| handle.path == path)
            .ok_or_else(|| RegistryError::NotFound(path.to_path_buf()))?;

        // INVARIANT: a handle leaves the registry only while idle, so a re-add
        // can never start a second sequence beside one that is still running.
        if self.handles[index].state() != SyncState::Idle {
            return Err(RegistryError::Busy(path.to_path_buf()));
        }

        debug!("unregister {}", path.display());
        Ok(self.handles.remove(index))
    }

    /// List handles in insertion order.
    pub fn list(&self) -> &[RepositoryHandle] {
        &self.handles
    }

    /// Paths of monitored directories in insertion order.
    pub fn directories(&self) -> Vec<PathBuf> {
        self.handles.iter().map(|handle| handle.path.clone()).collect()
    }

    /// Look up handle by exact directory path.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&RepositoryHandle> {
        self.handles
            .iter()
            .find(|handle| handle.path == path.as_ref())
    }

    /// Find the handle whose directory is the longest prefix of path.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Option<&RepositoryHandle> {
        self.handles
            .iter()
            .filter(|handle| handle.owns(path.as_ref()))
            .max_by_key(|handle| handle.path.components().count())
    }

    /// Iterate every handle whose directory is a prefix of path.
    pub fn owners<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a RepositoryHandle> + 'a {
        self.handles.iter().filter(move |handle| handle.owns(path))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// All possible error types for registry interaction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("directory {0:?} is already monitored")]
    Duplicate(PathBuf),

    #[error("directory {0:?} is not monitored")]
    NotFound(PathBuf),

    #[error("directory {0:?} must be an absolute path")]
    NotAbsolute(PathBuf),

    #[error("directory {0:?} is busy syncing")]
    Busy(PathBuf),
}

/// Friendly result alias :3
type Result<T, E = RegistryError> = std::result::Result<T, E>;
