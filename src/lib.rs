// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Keep local directories continuously mirrored to remote Git repositories.
//!
//! Each __monitored directory__ is the work tree of a Git repository. Glint
//! watches those directories for changes, coalesces bursts of changes into
//! batches, and pushes each batch as a single commit. Remote changes are
//! pulled on a fixed interval and right after the machine wakes from sleep.
//!
//! # Pipeline
//!
//! 1. [`watch::PathWatcher`] turns OS file events into raw change events,
//!    dropping editor and Git internal noise.
//! 2. [`aggregate::Aggregator`] collects raw events over a quantized window,
//!    and partitions them by owning directory into change batches.
//! 3. [`sync::Orchestrator`] runs stage, commit, and push for each batch,
//!    pull on schedule, and clone on demand, with at most one sequence in
//!    flight per repository.
//! 4. [`sync::StatusReporter`] collapses per-repository state into a single
//!    idle or syncing signal.
//!
//! [`service::Service`] wires all of the above together into a daemon.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod path;
pub mod registry;
pub mod service;
pub mod sync;
pub mod watch;

pub use backend::{Backend, GitBackend};
pub use registry::{Registry, RepositoryHandle, SyncState};
pub use service::Service;
pub use sync::{Orchestrator, SyncEvent, SyncStatus};
