// SPDX-License-Identifier: Apache-2.0

//! File discovery and harvester supervision.
//!
//! Every scan expands the configured glob patterns and launches a
//! [`Harvester`] for each matching file that is not already being harvested.
//! The start position of a file comes from, in order:
//!
//! 1. the completion offset of an earlier harvester of the same file, so a
//!    dead file that grows again continues where it stopped
//! 2. the registrar offset, when the file identity is unchanged and the file
//!    did not shrink
//! 3. the configured [`StartAt`] for files present at the first scan, or the
//!    beginning for files that appear later
//!
//! Replaced or truncated files start over at offset 0.

mod file_id;

pub use file_id::FileId;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::harvester::config::STDIN_PATH;
use crate::harvester::{self, Event, FileConfig, HarvestExit, Harvester, HarvesterTimings, StartAt};
use crate::registrar::OffsetStore;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct ProspectorSettings {
    /// Time between glob scans
    pub scan_interval: Duration,
    /// Start files that appear after the first scan at their end
    pub tail_new_files: bool,
    pub timings: HarvesterTimings,
}

impl Default for ProspectorSettings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            tail_new_files: false,
            timings: HarvesterTimings::default(),
        }
    }
}

type HarvestResult = (PathBuf, harvester::Result<HarvestExit>);

struct Active {
    id: Option<FileId>,
    finished: oneshot::Receiver<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Finished {
    id: Option<FileId>,
    offset: u64,
    /// Relaunch on the next scan even when the file did not grow
    retry: bool,
}

/// Where and how a harvester should start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Start {
    offset: u64,
    start_at: StartAt,
}

pub struct Prospector {
    configs: Vec<Arc<FileConfig>>,
    store: OffsetStore,
    output: BoundedSender<Event>,
    settings: ProspectorSettings,
    harvesters: JoinSet<HarvestResult>,
    active: HashMap<PathBuf, Active>,
    finished: HashMap<PathBuf, Finished>,
    skipped: HashSet<PathBuf>,
    stdin_started: bool,
    first_scan: bool,
}

impl Prospector {
    pub fn new(
        configs: Vec<Arc<FileConfig>>,
        store: OffsetStore,
        output: BoundedSender<Event>,
        settings: ProspectorSettings,
    ) -> Self {
        Self {
            configs,
            store,
            output,
            settings,
            harvesters: JoinSet::new(),
            active: HashMap::new(),
            finished: HashMap::new(),
            skipped: HashSet::new(),
            stdin_started: false,
            first_scan: true,
        }
    }

    /// Scan and supervise until cancelled, then wait for every harvester to
    /// flush and stop. The event sender is dropped on return.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BoxError> {
        info!(
            configs = self.configs.len(),
            scan_interval = %humantime::format_duration(self.settings.scan_interval),
            "Starting prospector"
        );

        let mut ticker = tokio::time::interval(self.settings.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,
                Some(joined) = self.harvesters.join_next() => self.on_harvester_done(joined),
                _ = ticker.tick() => self.scan(&cancel),
            }
        }

        debug!(active = self.active.len(), "Waiting for harvesters to stop");
        while let Some(joined) = self.harvesters.join_next().await {
            self.on_harvester_done(joined);
        }

        info!("Prospector stopped");
        Ok(())
    }

    fn scan(&mut self, cancel: &CancellationToken) {
        let configs = self.configs.clone();
        let mut matched = HashSet::new();
        for config in &configs {
            for pattern in &config.paths {
                if pattern == STDIN_PATH {
                    if !self.stdin_started {
                        self.stdin_started = true;
                        let start = Start {
                            offset: 0,
                            start_at: StartAt::Beginning,
                        };
                        self.launch(PathBuf::from(STDIN_PATH), config, None, start, cancel);
                    }
                    continue;
                }

                let paths = match glob::glob(pattern) {
                    Ok(paths) => paths,
                    Err(e) => {
                        error!(pattern = %pattern, error = %e, "Invalid glob pattern");
                        continue;
                    }
                };

                for entry in paths {
                    match entry {
                        Ok(path) => {
                            matched.insert(path.clone());
                            self.consider(path, config, cancel);
                        }
                        Err(e) => debug!(pattern = %pattern, error = %e, "Skipping unreadable glob match"),
                    }
                }
            }
        }

        // Forget paths that no longer match, a file showing up there later is new
        self.finished.retain(|path, _| matched.contains(path));
        self.skipped.retain(|path| matched.contains(path));
        self.first_scan = false;
    }

    fn consider(&mut self, path: PathBuf, config: &Arc<FileConfig>, cancel: &CancellationToken) {
        if self.active.contains_key(&path) || self.skipped.contains(&path) {
            return;
        }

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = ?path, error = %e, "Failed to stat matched path");
                return;
            }
        };
        let id = FileId::from_metadata(&metadata);

        if let Some(start) = self.start_position(&path, config, id, metadata.len()) {
            self.launch(path, config, Some(id), start, cancel);
        }
    }

    fn start_position(
        &self,
        path: &Path,
        config: &FileConfig,
        id: FileId,
        size: u64,
    ) -> Option<Start> {
        let from_beginning = |offset| Start {
            offset,
            start_at: StartAt::Beginning,
        };

        if let Some(done) = self.finished.get(path) {
            if done.id != Some(id) || size < done.offset {
                info!(path = ?path, "Finished file was replaced or truncated, starting over");
                return Some(from_beginning(0));
            }
            if size > done.offset || done.retry {
                return Some(from_beginning(done.offset));
            }
            return None;
        }

        if let Some(stored) = self.store.get(&path.to_string_lossy()) {
            let same_file = stored.id.map_or(true, |stored_id| stored_id == id);
            if same_file && size >= stored.offset {
                return Some(from_beginning(stored.offset));
            }
            info!(path = ?path, "Stored offset belongs to a replaced or truncated file, starting over");
            return Some(from_beginning(0));
        }

        let start_at = if self.first_scan {
            config.start_at
        } else if self.settings.tail_new_files {
            StartAt::End
        } else {
            StartAt::Beginning
        };
        let offset = match start_at {
            StartAt::Beginning => 0,
            StartAt::End => size,
        };
        Some(Start { offset, start_at })
    }

    fn launch(
        &mut self,
        path: PathBuf,
        config: &Arc<FileConfig>,
        id: Option<FileId>,
        start: Start,
        cancel: &CancellationToken,
    ) {
        if let Some(id) = id {
            if let Err(e) = self.store.track(&path.to_string_lossy(), id, start.offset) {
                warn!(path = ?path, error = %e, "Failed to track file identity");
            }
        }

        // A StartAt::End offset is only an estimate, the harvester seeks itself
        let resume_at = match start.start_at {
            StartAt::Beginning => start.offset,
            StartAt::End => 0,
        };
        let harvester = Harvester::new(path.clone(), config.clone(), resume_at)
            .with_start_at(start.start_at)
            .with_timings(self.settings.timings);

        debug!(path = ?path, offset = start.offset, start_at = ?start.start_at, "Launching harvester");

        let (finished_tx, finished_rx) = oneshot::channel();
        let output = self.output.clone();
        let token = cancel.child_token();
        let task_path = path.clone();
        self.harvesters.spawn(async move {
            let result = harvester.harvest(output, token, finished_tx).await;
            (task_path, result)
        });

        self.finished.remove(&path);
        self.active.insert(
            path,
            Active {
                id,
                finished: finished_rx,
            },
        );
    }

    fn on_harvester_done(&mut self, joined: Result<HarvestResult, JoinError>) {
        let (path, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = ?e, "Harvester task failed");
                return;
            }
        };

        let Some(mut active) = self.active.remove(&path) else {
            return;
        };
        let offset = active.finished.try_recv().unwrap_or_default();
        let is_stdin = path.as_os_str() == STDIN_PATH;

        let retry = match result {
            Ok(exit) => {
                info!(path = ?path, offset, reason = ?exit.reason, "Harvester stopped");
                false
            }
            Err(e) if e.is_unrecoverable() => {
                error!(path = ?path, error = %e, "Skipping path");
                self.skipped.insert(path);
                return;
            }
            Err(e) => {
                warn!(path = ?path, offset, error = %e, "Harvester failed, will retry on next scan");
                true
            }
        };

        if !is_stdin {
            self.finished.insert(
                path,
                Finished {
                    id: active.id,
                    offset,
                    retry,
                },
            );
        }
    }
}
