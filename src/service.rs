// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Daemon wiring.
//!
//! A [`Service`] owns the configuration directory, and assembles the sync
//! pipeline out of it:
//!
//! ```text
//! PathWatcher -> Aggregator -> Orchestrator -> Backend
//!                                   ^
//!                 Scheduler --------+
//! ```
//!
//! Changes to the monitored set go through the service so that the persisted
//! directory listing, the registry, and the watched roots never disagree.

use crate::{
    aggregate::{Aggregator, ChangeBatch},
    backend::{Backend, GitBackend},
    config::{ConfigError, DirectoryList, Settings},
    path::{directories_file, settings_file},
    registry::{Registry, RepositoryHandle},
    sync::{
        Orchestrator, PushReport, Scheduler, StatusReporter, SyncError, SyncEvent, SyncStatus,
        Trigger,
    },
    watch::{ChangeEvent, NoiseFilter, PathWatcher, WatchError, EVENT_CHANNEL_CAPACITY},
};

use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Notify},
    time::timeout,
};
use tracing::{debug, info, warn};

const BATCH_CHANNEL_CAPACITY: usize = 64;
const TRIGGER_CHANNEL_CAPACITY: usize = 8;

/// How long shutdown waits for pending change batches to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Sync daemon assembled from a configuration directory.
pub struct Service<B = GitBackend>
where
    B: Backend,
{
    config_dir: PathBuf,
    settings: Settings,
    orchestrator: Orchestrator<B>,
    scheduler: Scheduler,
}

impl Service<GitBackend> {
    /// Open service from configuration directory.
    ///
    /// Missing settings or directory listing files fall back to defaults.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::Config`] if either file cannot be parsed.
    /// - Return [`ServiceError::Io`] if either file cannot be read.
    pub async fn open(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();
        let settings: Settings = read_or_default(settings_file(&config_dir)).await?;
        let directories: DirectoryList = read_or_default(directories_file(&config_dir)).await?;
        let backend = GitBackend::new(settings.ssh.clone());

        Ok(Self::with_backend(config_dir, settings, directories, backend))
    }
}

impl<B> Service<B>
where
    B: Backend,
{
    /// Construct service from already loaded configuration.
    pub fn with_backend(
        config_dir: impl Into<PathBuf>,
        settings: Settings,
        directories: DirectoryList,
        backend: B,
    ) -> Self {
        let registry = Registry::from_paths(directories.paths());
        let orchestrator = Orchestrator::new(registry, backend, Arc::new(StatusReporter::new()));
        let scheduler = Scheduler::new(settings.pull_interval(), settings.wake_threshold());

        Self {
            config_dir: config_dir.into(),
            settings,
            orchestrator,
            scheduler,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Monitored directories in the order they were added.
    pub async fn directories(&self) -> Vec<PathBuf> {
        self.orchestrator.directories().await
    }

    /// Handles of monitored directories in the order they were added.
    pub async fn handles(&self) -> Vec<RepositoryHandle> {
        self.orchestrator.handles().await
    }

    /// Observe aggregate sync status.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.orchestrator.status().subscribe()
    }

    /// Observe state transitions and detected changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.orchestrator.subscribe()
    }

    /// Report that the system just woke from sleep.
    ///
    /// Fires a pull of every monitored directory once the service runs.
    pub fn notify_wake(&self) {
        self.scheduler.wake_handle().notify_one();
    }

    /// Handle through which an external lifecycle hook reports wake.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.scheduler.wake_handle()
    }

    /// Start monitoring a directory, and persist the new listing.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::Io`] if path cannot be resolved.
    /// - Return [`ServiceError::NotADirectory`] if path is not a directory.
    /// - Return [`ServiceError::Sync`] if directory is already monitored.
    pub async fn add_directory(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = tokio::fs::canonicalize(path.as_ref())
            .await
            .map_err(|source| ServiceError::Io {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
        if !path.is_dir() {
            return Err(ServiceError::NotADirectory(path));
        }

        self.orchestrator.add_directory(path.clone()).await?;
        self.persist().await?;

        Ok(path)
    }

    /// Stop monitoring a directory, and persist the new listing.
    ///
    /// The directory itself is left untouched on disk.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::Sync`] if directory is not monitored, or is
    ///   busy syncing.
    pub async fn remove_directory(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        // INVARIANT: Directory may already be gone from disk.
        let path = match tokio::fs::canonicalize(path.as_ref()).await {
            Ok(path) => path,
            Err(_) => path.as_ref().to_path_buf(),
        };

        self.orchestrator.remove_directory(&path).await?;
        self.persist().await?;

        Ok(path)
    }

    /// Clone remote into `parent`, monitor it, and persist the new listing.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::Io`] if parent cannot be made absolute.
    /// - Return [`ServiceError::Sync`] if clone fails.
    pub async fn clone_repository<F>(
        &self,
        url: &str,
        parent: impl AsRef<Path>,
        progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let parent = std::path::absolute(parent.as_ref()).map_err(|source| ServiceError::Io {
            path: parent.as_ref().to_path_buf(),
            source,
        })?;
        let path = self
            .orchestrator
            .clone_repository(url, &parent, progress)
            .await?;
        self.persist().await?;

        Ok(path)
    }

    /// Pull every monitored directory once.
    pub async fn pull_all(&self) -> Vec<(PathBuf, std::result::Result<(), SyncError>)> {
        self.orchestrator.pull_all().await
    }

    /// Push every monitored directory once.
    pub async fn push_all(&self) -> Vec<(PathBuf, std::result::Result<PushReport, SyncError>)> {
        self.orchestrator.push_all().await
    }

    /// Run the daemon until `shutdown` resolves.
    ///
    /// Pulls every monitored directory at startup, then keeps pushing local
    /// changes and pulling on schedule. Pending change batches get a short
    /// grace period to drain on shutdown.
    ///
    /// # Errors
    ///
    /// - Return [`ServiceError::Filter`] if an ignore pattern is malformed.
    /// - Return [`ServiceError::Watch`] if the OS watch facility cannot be
    ///   initialized.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            settings,
            orchestrator,
            scheduler,
            ..
        } = self;

        let (event_tx, event_rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel::<ChangeBatch>(BATCH_CHANNEL_CAPACITY);
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<Trigger>(TRIGGER_CHANNEL_CAPACITY);

        let filter = NoiseFilter::new(&settings.ignore)?;
        let mut watcher = PathWatcher::new(filter, event_tx)?;
        let mut roots = orchestrator.watch_roots();
        let initial = roots.borrow_and_update().clone();
        watch_directories(&mut watcher, initial);

        let aggregator = Aggregator::new(settings.debounce(), orchestrator.registry());
        let aggregating = tokio::spawn(aggregator.run(event_rx, batch_tx));
        let pushing = tokio::spawn(orchestrator.clone().run(batch_rx));
        let scheduling = tokio::spawn(scheduler.run(trigger_tx));

        info!("glint started");
        spawn_pull_all(&orchestrator, "startup");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = roots.changed() => {
                    if changed.is_err() {
                        break;
                    }

                    let directories = roots.borrow_and_update().clone();
                    watch_directories(&mut watcher, directories);
                }
                Some(trigger) = trigger_rx.recv() => {
                    let reason = match trigger {
                        Trigger::Periodic => "periodic",
                        Trigger::Wake => "wake",
                    };
                    spawn_pull_all(&orchestrator, reason);
                }
            }
        }

        info!("glint shutting down");
        scheduling.abort();
        drop(watcher);

        // INVARIANT: Dropping the watcher closes the raw event channel, which
        // flushes the aggregator, which in turn closes the batch channel.
        if timeout(SHUTDOWN_GRACE, async {
            let _ = aggregating.await;
            let _ = pushing.await;
        })
        .await
        .is_err()
        {
            warn!("pending changes did not drain before shutdown");
        }

        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let listing = DirectoryList::new(self.orchestrator.directories().await);
        let path = directories_file(&self.config_dir);
        let io_error = |source| ServiceError::Io {
            path: path.clone(),
            source,
        };

        mkdirp::mkdirp(&self.config_dir).map_err(|source| ServiceError::Io {
            path: self.config_dir.clone(),
            source,
        })?;
        tokio::fs::write(&path, listing.to_string())
            .await
            .map_err(io_error)?;
        debug!("persist directory listing to {}", path.display());

        Ok(())
    }
}

/// Point watcher at monitored directories.
///
/// Directories that cannot be watched were already reported one by one, and
/// still get pulled on schedule. Returns how many of them were skipped.
fn watch_directories(watcher: &mut PathWatcher, directories: Vec<PathBuf>) -> usize {
    let total = directories.len();
    let failures = watcher.replace_roots(directories);
    if !failures.is_empty() {
        warn!(
            "{} of {total} monitored directories are not watched for local changes",
            failures.len()
        );
    }

    failures.len()
}

fn spawn_pull_all<B>(orchestrator: &Orchestrator<B>, reason: &'static str)
where
    B: Backend,
{
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        info!("pull all directories ({reason})");
        for (path, result) in orchestrator.pull_all().await {
            if let Err(error) = result {
                debug!("pull {} not completed: {error}", path.display());
            }
        }
    });
}

async fn read_or_default<T>(path: PathBuf) -> Result<T>
where
    T: FromStr<Err = ConfigError> + Default,
{
    match tokio::fs::read_to_string(&path).await {
        Ok(data) => Ok(data.parse()?),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!("{} not found, using defaults", path.display());
            Ok(T::default())
        }
        Err(source) => Err(ServiceError::Io { path, source }),
    }
}

/// All possible error types for running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration file cannot be parsed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Sync operation fails.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// OS watch facility cannot be set up.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Noise pattern is malformed.
    #[error(transparent)]
    Filter(#[from] ignore::Error),

    /// Path cannot be used as a monitored directory.
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),

    /// File system access fails.
    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BackendError, CommitOutcome, PushOutcome, Result as BackendResult},
        registry::SyncState,
    };
    use indoc::indoc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
    }

    impl Backend for RecordingBackend {
        fn stage(&self, repo: &Path) -> BackendResult<()> {
            self.calls.lock().push(format!("stage {}", repo.display()));
            Ok(())
        }

        fn commit(&self, repo: &Path, message: &str) -> BackendResult<CommitOutcome> {
            self.calls
                .lock()
                .push(format!("commit {} {message}", repo.display()));
            Ok(CommitOutcome::Committed)
        }

        fn push(&self, repo: &Path) -> BackendResult<PushOutcome> {
            self.calls.lock().push(format!("push {}", repo.display()));
            Ok(PushOutcome::Pushed)
        }

        fn pull(&self, repo: &Path) -> BackendResult<()> {
            self.calls.lock().push(format!("pull {}", repo.display()));
            Ok(())
        }

        fn clone_remote(
            &self,
            _url: &str,
            _dest: &Path,
            _progress: &mut dyn FnMut(&str),
        ) -> BackendResult<()> {
            Err(BackendError::command("clone", "offline"))
        }
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<SyncEvent>,
        accept: impl Fn(&SyncEvent) -> bool,
    ) -> anyhow::Result<SyncEvent> {
        loop {
            let event = events.recv().await?;
            if accept(&event) {
                return Ok(event);
            }
        }
    }

    #[tokio::test]
    async fn open_without_files_uses_defaults() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        let service = Service::open(config.path()).await?;

        assert_eq!(service.settings(), &Settings::default());
        assert!(service.directories().await.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn open_reads_settings_and_directories() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        std::fs::write(
            settings_file(config.path()),
            indoc! {r#"
                debounce_secs = 2
                pull_interval_secs = 60
            "#},
        )?;
        std::fs::write(
            directories_file(config.path()),
            indoc! {r#"
                [[directory]]
                path = "/srv/notes"

                [[directory]]
                path = "/srv/project"
            "#},
        )?;

        let service = Service::open(config.path()).await?;
        assert_eq!(service.settings().debounce(), Duration::from_secs(2));
        assert_eq!(
            service.directories().await,
            vec![PathBuf::from("/srv/notes"), PathBuf::from("/srv/project")]
        );

        Ok(())
    }

    #[tokio::test]
    async fn malformed_settings_fail_to_open() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        std::fs::write(settings_file(config.path()), "debounce_secs = \"soon\"")?;

        let result = Service::open(config.path()).await;
        assert!(matches!(result, Err(ServiceError::Config(_))));

        Ok(())
    }

    #[tokio::test]
    async fn add_and_remove_persist_listing() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let notes = work.path().join("notes");
        std::fs::create_dir(&notes)?;
        let notes = notes.canonicalize()?;

        let service = Service::open(config.path().join("nested")).await?;
        assert_eq!(service.add_directory(&notes).await?, notes);

        let reopened = Service::open(config.path().join("nested")).await?;
        assert_eq!(reopened.directories().await, vec![notes.clone()]);

        reopened.remove_directory(&notes).await?;
        let reopened = Service::open(config.path().join("nested")).await?;
        assert!(reopened.directories().await.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn add_rejects_missing_and_duplicate_directories() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let file = work.path().join("file.txt");
        std::fs::write(&file, "x")?;
        let service = Service::open(config.path()).await?;

        let missing = service.add_directory(work.path().join("missing")).await;
        assert!(matches!(missing, Err(ServiceError::Io { .. })));

        let not_dir = service.add_directory(&file).await;
        assert!(matches!(not_dir, Err(ServiceError::NotADirectory(_))));

        service.add_directory(work.path()).await?;
        let duplicate = service.add_directory(work.path()).await;
        assert!(matches!(duplicate, Err(ServiceError::Sync(_))));

        Ok(())
    }

    #[tokio::test]
    async fn failed_clone_leaves_listing_untouched() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let service = Service::with_backend(
            config.path(),
            Settings::default(),
            DirectoryList::default(),
            RecordingBackend::default(),
        );

        let result = service
            .clone_repository("https://example.org/repo.git", work.path(), |_| {})
            .await;
        assert!(matches!(result, Err(ServiceError::Sync(_))));
        assert!(service.directories().await.is_empty());
        assert!(!directories_file(config.path()).exists());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_pulls_at_startup_then_pushes_changes() -> anyhow::Result<()> {
        let config = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let repo = work.path().canonicalize()?;
        let settings = Settings {
            debounce_secs: 1,
            ..Default::default()
        };
        let service = Service::with_backend(
            config.path(),
            settings,
            DirectoryList::new([repo.clone()]),
            RecordingBackend::default(),
        );
        let mut events = service.subscribe();
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(service.run(async move {
            let _ = stopped.await;
        }));

        let pulled = next_matching(&mut events, |event| {
            *event
                == SyncEvent::StateChanged {
                    directory: repo.clone(),
                    state: SyncState::Pulling,
                }
        });
        timeout(Duration::from_secs(10), pulled).await??;

        std::fs::write(repo.join("hello.txt"), "hello")?;
        let detected = next_matching(&mut events, |event| {
            matches!(event, SyncEvent::ChangeDetected { directory, .. } if *directory == repo)
        });
        let summary = match timeout(Duration::from_secs(10), detected).await?? {
            SyncEvent::ChangeDetected { summary, .. } => summary,
            other => anyhow::bail!("unexpected event {other:?}"),
        };
        assert_eq!(summary, "hello.txt");

        let _ = stop.send(());
        timeout(Duration::from_secs(10), running).await???;

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unwatchable_directory_is_counted_and_skipped() -> anyhow::Result<()> {
        let good = tempfile::tempdir()?;
        let gone = good.path().join("gone");
        let (tx, _rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watcher = PathWatcher::new(NoiseFilter::default(), tx)?;

        let skipped = watch_directories(&mut watcher, vec![gone.clone(), good.path().into()]);
        assert_eq!(skipped, 1);
        assert!(watcher.is_watching(good.path()));
        assert!(!watcher.is_watching(&gone));

        assert_eq!(watch_directories(&mut watcher, vec![good.path().into()]), 0);

        Ok(())
    }
}
