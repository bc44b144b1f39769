// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sync orchestration.
//!
//! The orchestrator drives monitored repositories through their sync
//! sequences:
//!
//! - __Push__: stage every change, commit with a message derived from the
//!   change batch, then push to the configured remote. Triggered by change
//!   batches from the aggregator, or by an explicit push of everything.
//! - __Pull__: fetch and integrate remote changes. Triggered by the periodic
//!   timer, wake from sleep, or an explicit pull of everything.
//! - __Clone__: bootstrap a new monitored directory from a remote.
//!
//! # At Most One In Flight
//!
//! Each repository runs at most one sequence at a time. A push or pull
//! requested while the repository is not idle is rejected outright instead of
//! queued. The dropped trigger is not lost work, the next change batch, timer
//! tick, or manual request re-runs the same idempotent sequence and picks up
//! everything that accumulated in the meantime. Sequences on different
//! repositories run concurrently.
//!
//! # Failure Containment
//!
//! A failing step aborts the rest of its sequence, moves the repository into
//! [`SyncState::Error`] so observers see the diagnostic, and then settles the
//! repository back to idle. A failed push therefore never blocks a later pull
//! or push on the same repository. Nothing is rolled back. The next successful
//! sequence continues from whatever state the work tree is in. Fan-out over
//! all repositories isolates each repository's result from the others.

pub mod schedule;
pub mod status;

pub use schedule::{Scheduler, Trigger, WakeDetector};
pub use status::{StatusReporter, SyncStatus};

use crate::{
    aggregate::{summarize, ChangeBatch},
    backend::{Backend, BackendError, CommitOutcome, GitBackend, PushOutcome},
    registry::{Operation, Registry, RegistryError, RepositoryHandle, SyncState},
};

use futures::future::join_all;
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, instrument, warn};

/// Capacity of sync event broadcast channel.
pub const EVENT_CAPACITY: usize = 256;

/// Notification published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Repository moved into a new sync state.
    StateChanged { directory: PathBuf, state: SyncState },

    /// Change batch arrived for a monitored directory.
    ChangeDetected { directory: PathBuf, summary: String },
}

/// Outcome of a successful push sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub commit: CommitOutcome,
    pub push: PushOutcome,
}

/// Backend step a sequence failed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Stage,
    Commit,
    Push,
    Pull,
    Clone,
}

impl Display for Step {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Stage => fmt.write_str("stage"),
            Self::Commit => fmt.write_str("commit"),
            Self::Push => fmt.write_str("push"),
            Self::Pull => fmt.write_str("pull"),
            Self::Clone => fmt.write_str("clone"),
        }
    }
}

/// Drive monitored repositories through push, pull, and clone sequences.
pub struct Orchestrator<B = GitBackend>
where
    B: Backend,
{
    registry: Arc<RwLock<Registry>>,
    backend: Arc<B>,
    status: Arc<StatusReporter>,
    events: broadcast::Sender<SyncEvent>,
    roots: watch::Sender<Vec<PathBuf>>,
}

impl<B> Clone for Orchestrator<B>
where
    B: Backend,
{
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            backend: self.backend.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
            roots: self.roots.clone(),
        }
    }
}

impl<B> Orchestrator<B>
where
    B: Backend,
{
    /// Construct new orchestrator.
    ///
    /// Every state transition is reported to `status`.
    pub fn new(registry: Registry, backend: B, status: Arc<StatusReporter>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (roots, _) = watch::channel(registry.directories());

        Self {
            registry: Arc::new(RwLock::new(registry)),
            backend: Arc::new(backend),
            status,
            events,
            roots,
        }
    }

    /// Shared registry of monitored directories.
    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    /// Aggregate status reporter.
    pub fn status(&self) -> Arc<StatusReporter> {
        self.status.clone()
    }

    /// Observe state transitions and detected changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Observe the set of directories that should be watched.
    pub fn watch_roots(&self) -> watch::Receiver<Vec<PathBuf>> {
        self.roots.subscribe()
    }

    /// Monitored directories in registry order.
    pub async fn directories(&self) -> Vec<PathBuf> {
        self.registry.read().await.directories()
    }

    /// Handles of monitored directories in registry order.
    pub async fn handles(&self) -> Vec<RepositoryHandle> {
        self.registry.read().await.list().to_vec()
    }

    /// Start monitoring a directory.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if directory is invalid or already
    ///   monitored.
    pub async fn add_directory(&self, path: impl Into<PathBuf>) -> Result<RepositoryHandle> {
        let mut registry = self.registry.write().await;
        let handle = registry.add(path)?;
        self.roots.send_replace(registry.directories());
        info!("monitor {}", handle.path().display());

        Ok(handle)
    }

    /// Stop monitoring a directory.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if directory is not monitored, or is
    ///   still in the middle of a sequence.
    pub async fn remove_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut registry = self.registry.write().await;
        let handle = registry.remove(path)?;
        self.roots.send_replace(registry.directories());
        info!("stop monitoring {}", handle.path().display());

        Ok(())
    }

    /// Consume change batches until the channel closes.
    ///
    /// Each batch runs as its own task, so repositories push concurrently.
    pub async fn run(self, mut batches: mpsc::Receiver<ChangeBatch>) {
        while let Some(batch) = batches.recv().await {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                // INVARIANT: Failures were already logged and published.
                let _ = orchestrator.push_batch(batch).await;
            });
        }

        debug!("orchestrator stopped");
    }

    /// Run push sequence for a change batch.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::Registry`] if batch directory is no longer
    ///   monitored.
    /// - Return [`SyncError::Rejected`] if repository is busy.
    /// - Return [`SyncError::Backend`] if any backend step fails.
    pub async fn push_batch(&self, batch: ChangeBatch) -> Result<PushReport> {
        let handle = self.lookup(&batch.directory).await?;
        let summary = batch.summary();
        let _ = self.events.send(SyncEvent::ChangeDetected {
            directory: batch.directory.clone(),
            summary: summary.clone(),
        });

        self.push(&handle, summary).await
    }

    /// Run push sequence for one monitored directory with a generic message.
    pub async fn push_directory(&self, path: impl AsRef<Path>) -> Result<PushReport> {
        let handle = self.lookup(path.as_ref()).await?;
        self.push(&handle, summarize(handle.path(), &BTreeSet::new()))
            .await
    }

    /// Run pull sequence for one monitored directory.
    pub async fn pull_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        let handle = self.lookup(path.as_ref()).await?;
        self.pull(&handle).await
    }

    /// Run push sequence on every monitored directory.
    ///
    /// Results come back in registry order. A failure in one repository
    /// never affects the others.
    pub async fn push_all(&self) -> Vec<(PathBuf, Result<PushReport>)> {
        let handles = self.handles().await;
        let runs = handles.iter().map(|handle| async move {
            let message = summarize(handle.path(), &BTreeSet::new());
            (handle.path().to_path_buf(), self.push(handle, message).await)
        });

        join_all(runs).await
    }

    /// Run pull sequence on every monitored directory.
    ///
    /// Results come back in registry order. A failure in one repository
    /// never affects the others.
    pub async fn pull_all(&self) -> Vec<(PathBuf, Result<()>)> {
        let handles = self.handles().await;
        let runs = handles
            .iter()
            .map(|handle| async move { (handle.path().to_path_buf(), self.pull(handle).await) });

        join_all(runs).await
    }

    /// Clone remote repository into `parent/<remote-name>` and monitor it.
    ///
    /// Progress lines from the backend are handed to `progress` as they
    /// arrive. The directory is registered only after a successful clone. A
    /// failed clone leaves whatever the backend created behind for the caller
    /// to clean up or retry.
    ///
    /// # Errors
    ///
    /// - Return [`SyncError::InvalidUrl`] if no directory name can be derived
    ///   from URL.
    /// - Return [`SyncError::DestinationExists`] if target directory exists
    ///   and is not empty.
    /// - Return [`SyncError::Backend`] if clone fails.
    /// - Return [`SyncError::Registry`] if target directory is already
    ///   monitored.
    #[instrument(skip(self, parent, progress), level = "debug")]
    pub async fn clone_repository<F>(
        &self,
        url: &str,
        parent: impl AsRef<Path>,
        mut progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let name = repository_name(url).ok_or_else(|| SyncError::InvalidUrl(url.into()))?;
        let dest = parent.as_ref().join(name);
        if self.registry.read().await.get(&dest).is_some() {
            return Err(RegistryError::Duplicate(dest).into());
        }

        if is_non_empty_dir(&dest) {
            return Err(SyncError::DestinationExists(dest));
        }

        mkdirp::mkdirp(parent.as_ref()).map_err(|source| SyncError::CreateDir {
            path: parent.as_ref().to_path_buf(),
            source,
        })?;

        info!("clone {url} into {}", dest.display());
        let backend = self.backend.clone();
        let url = url.to_string();
        let target = dest.clone();
        let result =
            tokio::task::spawn_blocking(move || backend.clone_remote(&url, &target, &mut progress))
                .await
                .unwrap_or_else(|error| Err(BackendError::command("clone", error.to_string())));

        if let Err(source) = result {
            warn!("clone into {} failed: {source}", dest.display());
            return Err(SyncError::Backend {
                path: dest,
                step: Step::Clone,
                source,
            });
        }

        self.add_directory(dest.clone()).await?;

        Ok(dest)
    }

    async fn lookup(&self, path: &Path) -> Result<RepositoryHandle> {
        self.registry
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(path.to_path_buf()).into())
    }

    #[instrument(skip(self, handle), fields(repo = %handle.path().display()), level = "debug")]
    async fn push(&self, handle: &RepositoryHandle, message: String) -> Result<PushReport> {
        self.begin(handle, Operation::Push)?;

        let backend = self.backend.clone();
        let path = handle.path().to_path_buf();
        let result = tokio::task::spawn_blocking(move || push_sequence(&*backend, &path, &message))
            .await
            .unwrap_or_else(|error| Err(aborted(handle.path(), Step::Push, error)));

        if let Ok(report) = &result {
            info!(
                "push {} finished: {:?}, {:?}",
                handle.path().display(),
                report.commit,
                report.push
            );
        }

        self.finish(handle, result)
    }

    #[instrument(skip(self, handle), fields(repo = %handle.path().display()), level = "debug")]
    async fn pull(&self, handle: &RepositoryHandle) -> Result<()> {
        self.begin(handle, Operation::Pull)?;

        let backend = self.backend.clone();
        let path = handle.path().to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            backend.pull(&path).map_err(|source| SyncError::Backend {
                path,
                step: Step::Pull,
                source,
            })
        })
        .await
        .unwrap_or_else(|error| Err(aborted(handle.path(), Step::Pull, error)));

        if result.is_ok() {
            info!("pull {} finished", handle.path().display());
        }

        self.finish(handle, result)
    }

    fn begin(&self, handle: &RepositoryHandle, operation: Operation) -> Result<()> {
        match handle.try_begin(operation) {
            Ok(state) => {
                self.publish(handle, state);
                Ok(())
            }
            Err(state) => {
                debug!(
                    "reject {operation} on {} while {state}",
                    handle.path().display()
                );
                Err(SyncError::Rejected {
                    path: handle.path().to_path_buf(),
                    operation,
                    state,
                })
            }
        }
    }

    fn finish<T>(&self, handle: &RepositoryHandle, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            warn!("{error}");
            let state = handle.fail(error.diagnostic());
            self.publish(handle, state);
        }

        let state = handle.settle();
        self.publish(handle, state);

        result
    }

    fn publish(&self, handle: &RepositoryHandle, state: SyncState) {
        self.status.record(handle.path(), &state);
        let _ = self.events.send(SyncEvent::StateChanged {
            directory: handle.path().to_path_buf(),
            state,
        });
    }
}

fn push_sequence<B>(backend: &B, path: &Path, message: &str) -> Result<PushReport>
where
    B: Backend + ?Sized,
{
    let step = |step: Step| {
        move |source: BackendError| SyncError::Backend {
            path: path.to_path_buf(),
            step,
            source,
        }
    };

    backend.stage(path).map_err(step(Step::Stage))?;
    let commit = backend.commit(path, message).map_err(step(Step::Commit))?;
    let push = backend.push(path).map_err(step(Step::Push))?;

    Ok(PushReport { commit, push })
}

fn aborted(path: &Path, step: Step, error: tokio::task::JoinError) -> SyncError {
    SyncError::Backend {
        path: path.to_path_buf(),
        step,
        source: BackendError::command(step.to_string(), error.to_string()),
    }
}

/// Derive local directory name from remote URL.
///
/// Takes the last path segment, dropping a trailing `.git`. Works for both
/// URLs and scp-like `user@host:path` remotes.
pub fn repository_name(url: &str) -> Option<&str> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);

    (!name.is_empty() && name != "." && name != "..").then_some(name)
}

fn is_non_empty_dir(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => path.exists(),
    }
}

/// All possible error types for sync orchestration.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Repository already runs a sequence.
    #[error("{operation} rejected for {path:?}: repository is {state}")]
    Rejected {
        path: PathBuf,
        operation: Operation,
        state: SyncState,
    },

    /// Backend step failed.
    #[error("{step} failed for {path:?}: {source}")]
    Backend {
        path: PathBuf,
        step: Step,
        #[source]
        source: BackendError,
    },

    /// No directory name can be derived from clone URL.
    #[error("cannot derive directory name from {0:?}")]
    InvalidUrl(String),

    /// Clone target already holds files.
    #[error("destination {0:?} already exists and is not empty")]
    DestinationExists(PathBuf),

    /// Clone parent directory cannot be created.
    #[error("failed to create directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Registry rejected a mutation or lookup.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SyncError {
    /// Diagnostic text suitable for repository error state.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Backend { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }

    /// Check if error is a rejected trigger rather than a failure.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
