// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Pull scheduling.
//!
//! Remote changes are absorbed on a fixed interval, and once more right after
//! the machine wakes from sleep, since a laptop that slept through several
//! intervals is likely far behind its remotes.
//!
//! # Wake Detection
//!
//! The monotonic clock stops while the system is suspended, but the wall
//! clock keeps going. Sampling both on a short probe interval, and comparing
//! how far each one moved, reveals a suspend as a large wall-clock gap. An
//! external lifecycle hook can also report a wake directly through
//! [`Scheduler::wake_handle`].

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{mpsc, Notify},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

/// How often to sample clocks for wake detection.
pub const WAKE_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Reason a pull was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Periodic,
    Wake,
}

/// Detect suspend/resume by comparing wall and monotonic clocks.
#[derive(Debug, Clone)]
pub struct WakeDetector {
    last_wall: SystemTime,
    last_mono: Instant,
    threshold: Duration,
}

impl WakeDetector {
    /// Construct new wake detector anchored at given clock samples.
    pub fn new(wall: SystemTime, mono: Instant, threshold: Duration) -> Self {
        Self {
            last_wall: wall,
            last_mono: mono,
            threshold,
        }
    }

    /// Feed fresh clock samples, returning whether a wake happened in between.
    pub fn observe(&mut self, wall: SystemTime, mono: Instant) -> bool {
        // INVARIANT: A wall clock stepped backwards is not a wake.
        let wall_elapsed = wall.duration_since(self.last_wall).unwrap_or_default();
        let mono_elapsed = mono.saturating_duration_since(self.last_mono);
        self.last_wall = wall;
        self.last_mono = mono;

        wall_elapsed.saturating_sub(mono_elapsed) > self.threshold
    }
}

/// Fire pull triggers on a fixed interval and after wake from sleep.
#[derive(Debug)]
pub struct Scheduler {
    interval: Duration,
    wake_threshold: Duration,
    wake: Arc<Notify>,
}

impl Scheduler {
    /// Construct new scheduler.
    pub fn new(interval: Duration, wake_threshold: Duration) -> Self {
        Self {
            interval,
            wake_threshold,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle through which an external hook reports wake from sleep.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run until the trigger receiver goes away.
    ///
    /// The first periodic trigger fires one full interval after start.
    pub async fn run(self, triggers: mpsc::Sender<Trigger>) {
        let start = Instant::now();
        let mut periodic = interval_at(start + self.interval, self.interval);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe = interval_at(start + WAKE_PROBE_INTERVAL, WAKE_PROBE_INTERVAL);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut detector = WakeDetector::new(SystemTime::now(), start, self.wake_threshold);

        loop {
            let trigger = tokio::select! {
                _ = periodic.tick() => Trigger::Periodic,
                _ = probe.tick() => {
                    if !detector.observe(SystemTime::now(), Instant::now()) {
                        continue;
                    }
                    info!("system woke from sleep");
                    Trigger::Wake
                }
                _ = self.wake.notified() => Trigger::Wake,
            };

            debug!("schedule {trigger:?} pull");
            if triggers.send(trigger).await.is_err() {
                break;
            }
        }
    }
}
