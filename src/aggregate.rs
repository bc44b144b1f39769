// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Change aggregation.
//!
//! Editors rarely change one file once. Saving a document can produce a burst
//! of create, modify, and rename notifications for the same path, and a
//! `git checkout` touches hundreds of files at once. Syncing on every raw
//! event would flood the remote with tiny commits, so raw [`ChangeEvent`]s are
//! coalesced into [`ChangeBatch`]es first.
//!
//! # Debounce Window
//!
//! The window is quantized: it opens with the _first_ event of a new batch,
//! and closes a fixed duration later no matter how many events arrive in
//! between. Events arriving after the window closes start the next batch.
//! A sliding window that restarts on every event could starve a directory
//! that changes continuously.
//!
//! # Partitioning
//!
//! When the window closes, the deduplicated set of changed paths is split by
//! monitored directory. Each directory that is a path prefix of at least one
//! changed path gets one batch holding exactly the paths under it. Nested
//! directories all receive the change. Paths under no monitored directory are
//! discarded. Batches come out in registry order.

use crate::{registry::Registry, watch::ChangeEvent};

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, RwLock},
    time::{sleep_until, Instant},
};
use tracing::{debug, info};

/// Deduplicated set of changed paths under one monitored directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Monitored directory the paths fall under.
    pub directory: PathBuf,

    /// Changed paths, sorted and unique.
    pub paths: BTreeSet<PathBuf>,
}

impl ChangeBatch {
    /// Construct new change batch.
    pub fn new(
        directory: impl Into<PathBuf>,
        paths: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        Self {
            directory: directory.into(),
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Human readable summary of batch for commit messages.
    ///
    /// Uses the first changed path relative to the monitored directory. Falls
    /// back to "Sync" when no changed path can name the batch.
    pub fn summary(&self) -> String {
        summarize(&self.directory, &self.paths)
    }
}

/// Summarize changed paths under directory.
pub fn summarize(directory: &Path, paths: &BTreeSet<PathBuf>) -> String {
    let first = paths
        .iter()
        .filter_map(|path| path.strip_prefix(directory).ok())
        .find(|relative| !relative.as_os_str().is_empty());

    match first {
        Some(relative) if paths.len() > 1 => {
            format!("{} (+{} more)", relative.display(), paths.len() - 1)
        }
        Some(relative) => relative.display().to_string(),
        None => "Sync".into(),
    }
}

/// Collect raw events within a quantized window.
#[derive(Debug)]
pub struct Coalescer {
    pending: BTreeSet<PathBuf>,
    deadline: Option<Instant>,
    window: Duration,
}

impl Coalescer {
    /// Construct new coalescer with debounce window.
    pub fn new(window: Duration) -> Self {
        Self {
            pending: BTreeSet::new(),
            deadline: None,
            window,
        }
    }

    /// Record raw event.
    ///
    /// The first event of a batch opens the window. Later events only join
    /// the batch.
    pub fn record(&mut self, event: ChangeEvent) {
        if self.deadline.is_none() {
            self.deadline = Some(event.timestamp + self.window);
        }

        self.pending.insert(event.path);
    }

    /// When the current window closes, if a batch is building.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check if window has closed at given time.
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Take collected paths and reset for the next batch.
    pub fn take(&mut self) -> BTreeSet<PathBuf> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Split changed paths into one batch per owning monitored directory.
///
/// Batches are ordered by registry order. A path under no monitored
/// directory ends up in no batch.
pub fn partition(paths: &BTreeSet<PathBuf>, registry: &Registry) -> Vec<ChangeBatch> {
    registry
        .list()
        .iter()
        .filter_map(|handle| {
            let owned = paths
                .iter()
                .filter(|path| handle.owns(path))
                .cloned()
                .collect::<BTreeSet<_>>();

            (!owned.is_empty()).then(|| ChangeBatch {
                directory: handle.path().to_path_buf(),
                paths: owned,
            })
        })
        .collect()
}

/// Long running aggregation task.
///
/// Consumes raw events from the path watcher, and emits change batches to the
/// orchestrator.
pub struct Aggregator {
    coalescer: Coalescer,
    registry: Arc<RwLock<Registry>>,
}

impl Aggregator {
    /// Construct new aggregator.
    pub fn new(window: Duration, registry: Arc<RwLock<Registry>>) -> Self {
        Self {
            coalescer: Coalescer::new(window),
            registry,
        }
    }

    /// Run until the raw event channel closes.
    ///
    /// Anything still pending when the channel closes is flushed immediately.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ChangeEvent>,
        batches: mpsc::Sender<ChangeBatch>,
    ) {
        loop {
            let Some(deadline) = self.coalescer.deadline() else {
                match events.recv().await {
                    Some(event) => {
                        self.coalescer.record(event);
                        continue;
                    }
                    None => break,
                }
            };

            // INVARIANT: Drain queued events before the timer so every event
            // lands in the window its timestamp belongs to.
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    Some(event) => {
                        if self.coalescer.is_due(event.timestamp) {
                            self.flush(&batches).await;
                        }
                        self.coalescer.record(event);
                    }
                    None => {
                        self.flush(&batches).await;
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.flush(&batches).await,
            }
        }

        debug!("change aggregator stopped");
    }

    async fn flush(&mut self, batches: &mpsc::Sender<ChangeBatch>) {
        let paths = self.coalescer.take();
        if paths.is_empty() {
            return;
        }

        let routed = {
            let registry = self.registry.read().await;
            let routed = partition(&paths, &registry);
            for path in paths.iter().filter(|path| registry.resolve(path).is_none()) {
                debug!("drop unmonitored change {}", path.display());
            }

            routed
        };

        for batch in routed {
            info!(
                "{} change(s) in {}",
                batch.paths.len(),
                batch.directory.display()
            );
            if batches.send(batch).await.is_err() {
                debug!("batch receiver closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::{advance, timeout};

    fn shared(paths: &[&str]) -> Arc<RwLock<Registry>> {
        Arc::new(RwLock::new(Registry::from_paths(paths.iter().copied())))
    }

    fn spawn_aggregator(
        window: Duration,
        registry: Arc<RwLock<Registry>>,
    ) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeBatch>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (batch_tx, batch_rx) = mpsc::channel(64);
        tokio::spawn(Aggregator::new(window, registry).run(event_rx, batch_tx));

        (event_tx, batch_rx)
    }

    #[test]
    fn summary_strips_directory_prefix() {
        let batch = ChangeBatch::new("/home/u/project", ["/home/u/project/docs/a.txt"]);
        assert_eq!(batch.summary(), "docs/a.txt");

        let batch = ChangeBatch::new(
            "/home/u/project",
            ["/home/u/project/b.txt", "/home/u/project/a.txt"],
        );
        assert_eq!(batch.summary(), "a.txt (+1 more)");
    }

    #[test]
    fn summary_falls_back_to_sync() {
        let empty = ChangeBatch::new("/home/u/project", Vec::<PathBuf>::new());
        assert_eq!(empty.summary(), "Sync");

        let itself = ChangeBatch::new("/home/u/project", ["/home/u/project"]);
        assert_eq!(itself.summary(), "Sync");
    }

    #[test]
    fn summary_skips_directory_itself() {
        let batch = ChangeBatch::new(
            "/home/u/project",
            ["/home/u/project", "/home/u/project/notes.md"],
        );
        assert_eq!(batch.summary(), "notes.md (+1 more)");
    }

    #[tokio::test(start_paused = true)]
    async fn coalescer_window_starts_at_first_event() {
        let mut coalescer = Coalescer::new(Duration::from_secs(10));
        let start = Instant::now();
        assert!(!coalescer.is_due(start));

        coalescer.record(ChangeEvent::now("/p/a.txt"));
        advance(Duration::from_secs(9)).await;
        coalescer.record(ChangeEvent::now("/p/b.txt"));
        coalescer.record(ChangeEvent::now("/p/a.txt"));

        assert_eq!(coalescer.deadline(), Some(start + Duration::from_secs(10)));
        assert!(!coalescer.is_due(Instant::now()));

        advance(Duration::from_secs(1)).await;
        assert!(coalescer.is_due(Instant::now()));
        assert_eq!(
            coalescer.take(),
            BTreeSet::from([PathBuf::from("/p/a.txt"), PathBuf::from("/p/b.txt")])
        );
        assert!(!coalescer.has_pending());
        assert_eq!(coalescer.deadline(), None);
    }

    #[test]
    fn partition_routes_to_every_prefix_in_registry_order() {
        let registry = Registry::from_paths(["/home/u/project/docs", "/home/u/notes", "/home/u/project"]);
        let paths = BTreeSet::from([
            PathBuf::from("/home/u/project/docs/guide.md"),
            PathBuf::from("/home/u/project/src/main.rs"),
            PathBuf::from("/home/u/projects/elsewhere.txt"),
            PathBuf::from("/tmp/scratch"),
        ]);

        assert_eq!(
            partition(&paths, &registry),
            vec![
                ChangeBatch::new("/home/u/project/docs", ["/home/u/project/docs/guide.md"]),
                ChangeBatch::new(
                    "/home/u/project",
                    ["/home/u/project/docs/guide.md", "/home/u/project/src/main.rs"]
                ),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_becomes_one_deduplicated_batch() -> anyhow::Result<()> {
        let (events, mut batches) =
            spawn_aggregator(Duration::from_secs(10), shared(&["/home/u/project"]));
        let start = Instant::now();

        events.send(ChangeEvent::now("/home/u/project/a.txt")).await?;
        advance(Duration::from_secs(2)).await;
        events.send(ChangeEvent::now("/home/u/project/b.txt")).await?;
        events.send(ChangeEvent::now("/home/u/project/a.txt")).await?;

        let batch = batches.recv().await.expect("aggregator stopped");
        assert_eq!(
            batch,
            ChangeBatch::new(
                "/home/u/project",
                ["/home/u/project/a.txt", "/home/u/project/b.txt"]
            )
        );
        assert!(start.elapsed() >= Duration::from_secs(10));

        // INVARIANT: Exactly one batch for the burst.
        let next = timeout(Duration::from_secs(60), batches.recv()).await;
        assert!(next.is_err());

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn window_does_not_slide() -> anyhow::Result<()> {
        let (events, mut batches) =
            spawn_aggregator(Duration::from_secs(10), shared(&["/p"]));

        for second in [0u64, 3, 6, 9, 12] {
            events.send(ChangeEvent::now(format!("/p/{second}.txt"))).await?;
            advance(Duration::from_secs(3)).await;
        }

        let first = batches.recv().await.expect("aggregator stopped");
        assert_eq!(
            first,
            ChangeBatch::new("/p", ["/p/0.txt", "/p/3.txt", "/p/6.txt", "/p/9.txt"])
        );

        let second = batches.recv().await.expect("aggregator stopped");
        assert_eq!(second, ChangeBatch::new("/p", ["/p/12.txt"]));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unmonitored_changes_are_dropped() -> anyhow::Result<()> {
        let (events, mut batches) =
            spawn_aggregator(Duration::from_secs(10), shared(&["/home/u/project"]));

        events.send(ChangeEvent::now("/etc/hosts")).await?;
        events.send(ChangeEvent::now("/home/u/project/a.txt")).await?;

        let batch = batches.recv().await.expect("aggregator stopped");
        assert_eq!(batch, ChangeBatch::new("/home/u/project", ["/home/u/project/a.txt"]));

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn closing_channel_flushes_pending() -> anyhow::Result<()> {
        let (events, mut batches) =
            spawn_aggregator(Duration::from_secs(10), shared(&["/p"]));

        events.send(ChangeEvent::now("/p/a.txt")).await?;
        drop(events);

        assert_eq!(
            batches.recv().await,
            Some(ChangeBatch::new("/p", ["/p/a.txt"]))
        );
        assert_eq!(batches.recv().await, None);

        Ok(())
    }
}
