// SPDX-License-Identifier: Apache-2.0

//! Per-file harvest loop.
//!
//! A [`Harvester`] owns one source for its whole life:
//!
//! - Opening: `-` binds to stdin. Files are opened with a fixed retry backoff
//!   and must be regular files. The start position is the stored offset, or
//!   the beginning/end of the file per [`StartAt`].
//! - Reading: one line per iteration through the [`LineReader`]. When no line
//!   arrives within the read timeout the file size is compared to the offset
//!   to detect truncation, then the idle time is compared to the dead time.
//! - Exit: on dead time, cancellation, a closed output or a read error. Any
//!   buffered multiline record is flushed first and the final offset is sent
//!   on the completion channel.

use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, Stdin};
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::harvester::config::{FileConfig, HarvesterTimings, STDIN_PATH, StartAt};
use crate::harvester::error::{Error, Result};
use crate::harvester::event::Event;
use crate::harvester::line_reader::{LineReader, ReadOutcome};
use crate::harvester::multiline::{MultilineAggregator, RawLine, Record};

/// Why a harvester stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Nothing was read for longer than the dead time
    Dead,
    /// The cancellation token fired
    Cancelled,
    /// Nobody is consuming events anymore
    OutputClosed,
}

/// Final state of a finished harvester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestExit {
    pub offset: u64,
    pub reason: ExitReason,
}

/// Internal signal that the loop must stop
enum Stop {
    Cancelled,
    OutputClosed,
}

impl From<Stop> for ExitReason {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::Cancelled => ExitReason::Cancelled,
            Stop::OutputClosed => ExitReason::OutputClosed,
        }
    }
}

/// The opened source
enum Input {
    File(LineReader<File>),
    Stdin(LineReader<Stdin>),
}

impl Input {
    async fn read_line(&mut self) -> io::Result<ReadOutcome> {
        match self {
            Input::File(reader) => reader.read_line().await,
            Input::Stdin(reader) => reader.read_line().await,
        }
    }

    /// Current size of the source, None for stdin
    async fn size(&self) -> io::Result<Option<u64>> {
        match self {
            Input::File(reader) => Ok(Some(reader.get_ref().metadata().await?.len())),
            Input::Stdin(_) => Ok(None),
        }
    }

    async fn rewind(&mut self) -> io::Result<()> {
        match self {
            Input::File(reader) => reader.seek_to(0).await.map(|_| ()),
            Input::Stdin(reader) => {
                reader.reset();
                Ok(())
            }
        }
    }
}

/// Tails a single file and sends its records as [`Event`]s
pub struct Harvester {
    path: PathBuf,
    source: Arc<str>,
    config: Arc<FileConfig>,
    offset: u64,
    line: u64,
    start_at: StartAt,
    timings: HarvesterTimings,
}

impl Harvester {
    /// Create a harvester for `path`, resuming at `offset` when it is non-zero
    pub fn new(path: impl Into<PathBuf>, config: Arc<FileConfig>, offset: u64) -> Self {
        let path = path.into();
        let source: Arc<str> = Arc::from(path.to_string_lossy().as_ref());
        Self {
            path,
            source,
            offset,
            line: 0,
            start_at: config.start_at,
            timings: HarvesterTimings::default(),
            config,
        }
    }

    pub fn with_timings(mut self, timings: HarvesterTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Override where a file without a stored offset starts
    pub fn with_start_at(mut self, start_at: StartAt) -> Self {
        self.start_at = start_at;
        self
    }

    pub fn is_stdin(&self) -> bool {
        &*self.source == STDIN_PATH
    }

    /// Run until the source goes dead, the token is cancelled, the output is
    /// closed or a fatal error occurs. The final offset is always sent on
    /// `finished`, even when an error is returned.
    pub async fn harvest(
        mut self,
        output: BoundedSender<Event>,
        cancel: CancellationToken,
        finished: oneshot::Sender<u64>,
    ) -> Result<HarvestExit> {
        let result = self.run(&output, &cancel).await;
        let _ = finished.send(self.offset);
        result
    }

    async fn run(
        &mut self,
        output: &BoundedSender<Event>,
        cancel: &CancellationToken,
    ) -> Result<HarvestExit> {
        let mut input = match self.open(cancel).await? {
            Some(input) => input,
            None => return Ok(self.exit(ExitReason::Cancelled)),
        };

        let mut multiline = self.config.multiline.as_ref().map(MultilineAggregator::new);
        let mut last_read = Instant::now();

        loop {
            let outcome = select! {
                biased;

                _ = cancel.cancelled() => {
                    self.flush_on_cancel(&mut multiline, output);
                    return Ok(self.exit(ExitReason::Cancelled));
                }
                outcome = input.read_line() => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Line(line)) => {
                    last_read = Instant::now();
                    self.line += 1;

                    let offset = self.offset;
                    self.offset += line.bytes as u64;

                    if line.cut {
                        debug!(path = ?self.path, bytes = line.bytes, "Line exceeded max_bytes, cut");
                    }

                    let raw = RawLine {
                        text: line.text,
                        offset,
                        bytes: line.bytes as u64,
                    };
                    let sent = match multiline.as_mut() {
                        Some(agg) => {
                            let mut sent = Ok(());
                            for record in agg.push(raw) {
                                sent = self.emit(record, output, cancel).await;
                                if sent.is_err() {
                                    break;
                                }
                            }
                            sent
                        }
                        None => self.emit(raw.into(), output, cancel).await,
                    };

                    if let Err(stop) = sent {
                        return Ok(self.exit(stop.into()));
                    }
                }
                Ok(ReadOutcome::Idle) => {
                    let size = match input.size().await {
                        Ok(size) => size,
                        Err(e) => {
                            error!(path = ?self.path, error = %e, "Failed to stat harvested file");
                            return Err(e.into());
                        }
                    };

                    if let Some(size) = size.filter(|size| *size < self.offset) {
                        info!(
                            path = ?self.path,
                            size,
                            offset = self.offset,
                            "File truncated, seeking to beginning"
                        );
                        if let Err(stop) = self.flush(&mut multiline, output, cancel).await {
                            return Ok(self.exit(stop.into()));
                        }
                        input.rewind().await?;
                        self.offset = 0;
                        continue;
                    }

                    let age = last_read.elapsed();
                    if age > self.config.dead_time {
                        info!(
                            path = ?self.path,
                            idle = %humantime::format_duration(age),
                            "Stopping harvest, file is dead"
                        );
                        if let Err(stop) = self.flush(&mut multiline, output, cancel).await {
                            return Ok(self.exit(stop.into()));
                        }
                        return Ok(self.exit(ExitReason::Dead));
                    }
                }
                Err(e) => {
                    error!(path = ?self.path, error = %e, "Unexpected error reading file");
                    // Best effort, the error wins either way
                    let _ = self.flush(&mut multiline, output, cancel).await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Open the source and position it. Returns None when cancelled while
    /// waiting to retry.
    async fn open(&mut self, cancel: &CancellationToken) -> Result<Option<Input>> {
        let max_bytes = self.config.max_bytes;

        if self.is_stdin() {
            info!("Harvesting standard input");
            self.offset = 0;
            return Ok(Some(Input::Stdin(LineReader::new(
                tokio::io::stdin(),
                max_bytes,
                &self.timings,
            ))));
        }

        let mut file = loop {
            match File::open(&self.path).await {
                Ok(file) => break file,
                Err(e) => {
                    warn!(path = ?self.path, error = %e, "Failed opening file, will retry");
                    select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = sleep(self.timings.open_backoff) => {}
                    }
                }
            }
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(Error::NotRegularFile(self.path.clone()));
        }

        let position = if self.offset > 0 {
            file.seek(io::SeekFrom::Start(self.offset)).await?
        } else if self.start_at == StartAt::End {
            file.seek(io::SeekFrom::End(0)).await?
        } else {
            file.seek(io::SeekFrom::Start(0)).await?
        };

        info!(
            path = ?self.path,
            offset = position,
            resumed = self.offset > 0,
            "Harvesting file"
        );
        self.offset = position;

        Ok(Some(Input::File(LineReader::new(
            file,
            max_bytes,
            &self.timings,
        ))))
    }

    fn event(&self, record: Record) -> Event {
        Event {
            source: self.source.clone(),
            offset: record.offset,
            len: record.len,
            line: self.line,
            text: record.text,
            config: self.config.clone(),
            timestamp: (!self.config.no_timestamp).then(Utc::now),
        }
    }

    /// Send one record, parking while the output is full
    async fn emit(
        &self,
        record: Record,
        output: &BoundedSender<Event>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Stop> {
        let event = self.event(record);
        select! {
            biased;

            _ = cancel.cancelled() => Err(Stop::Cancelled),
            sent = output.send(event) => sent.map_err(|_| Stop::OutputClosed),
        }
    }

    async fn flush(
        &self,
        multiline: &mut Option<MultilineAggregator>,
        output: &BoundedSender<Event>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Stop> {
        match multiline.as_mut().and_then(|agg| agg.flush()) {
            Some(record) => self.emit(record, output, cancel).await,
            None => Ok(()),
        }
    }

    /// After cancellation only hand over a pending record if there is room
    fn flush_on_cancel(
        &self,
        multiline: &mut Option<MultilineAggregator>,
        output: &BoundedSender<Event>,
    ) {
        if let Some(record) = multiline.as_mut().and_then(|agg| agg.flush()) {
            if let Err(e) = output.try_send(self.event(record)) {
                debug!(path = ?self.path, error = %e, "Dropped pending multiline record on shutdown");
            }
        }
    }

    fn exit(&self, reason: ExitReason) -> HarvestExit {
        debug!(path = ?self.path, offset = self.offset, ?reason, "Harvester finished");
        HarvestExit {
            offset: self.offset,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{BoundedReceiver, bounded};
    use crate::harvester::config::MultilineConfig;
    use regex::bytes::Regex;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn fast_timings() -> HarvesterTimings {
        HarvesterTimings {
            open_backoff: Duration::from_millis(20),
            read_timeout: Duration::from_millis(100),
            idle_poll: Duration::from_millis(10),
        }
    }

    fn from_beginning() -> FileConfig {
        FileConfig {
            start_at: StartAt::Beginning,
            no_timestamp: true,
            ..Default::default()
        }
    }

    fn append(path: &Path, data: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
    }

    struct Running {
        events: BoundedReceiver<Event>,
        cancel: CancellationToken,
        finished: oneshot::Receiver<u64>,
        handle: JoinHandle<Result<HarvestExit>>,
    }

    fn spawn(harvester: Harvester) -> Running {
        let (tx, events) = bounded(64);
        let cancel = CancellationToken::new();
        let (finished_tx, finished) = oneshot::channel();
        let handle = tokio::spawn(harvester.harvest(tx, cancel.clone(), finished_tx));
        Running {
            events,
            cancel,
            finished,
            handle,
        }
    }

    async fn next(events: &mut BoundedReceiver<Event>) -> Event {
        tokio::time::timeout(TEST_TIMEOUT, events.next())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_offsets_track_bytes_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"first\r\nsecond\nthird\n");

        let harvester =
            Harvester::new(&path, Arc::new(from_beginning()), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        let e1 = next(&mut running.events).await;
        let e2 = next(&mut running.events).await;
        let e3 = next(&mut running.events).await;

        assert_eq!((e1.offset, e1.len, e1.line), (0, 7, 1));
        assert_eq!(e1.text, b"first");
        assert_eq!((e2.offset, e2.len, e2.line), (7, 7, 2));
        assert_eq!((e3.offset, e3.len, e3.line), (14, 6, 3));
        assert_eq!(e3.end_offset(), 20);
        assert!(e1.timestamp.is_none());

        running.cancel.cancel();
        let exit = running.handle.await.unwrap().unwrap();
        assert_eq!(exit.reason, ExitReason::Cancelled);
        assert_eq!(exit.offset, 20);
        assert_eq!(running.finished.await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_resume_from_stored_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"old\nnew\n");

        let harvester =
            Harvester::new(&path, Arc::new(from_beginning()), 4).with_timings(fast_timings());
        let mut running = spawn(harvester);

        let e = next(&mut running.events).await;
        assert_eq!(e.text, b"new");
        assert_eq!(e.offset, 4);
        running.cancel.cancel();
    }

    #[tokio::test]
    async fn test_start_at_end_skips_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"existing\n");

        let config = FileConfig {
            start_at: StartAt::End,
            ..Default::default()
        };
        let harvester = Harvester::new(&path, Arc::new(config), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        // Give the harvester time to open and seek before appending
        tokio::time::sleep(Duration::from_millis(200)).await;
        append(&path, b"appended\n");

        let e = next(&mut running.events).await;
        assert_eq!(e.text, b"appended");
        assert_eq!(e.offset, 9);
        assert!(e.timestamp.is_some());
        running.cancel.cancel();
    }

    #[tokio::test]
    async fn test_truncation_restarts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"a long first line\nanother long line\n");

        let harvester =
            Harvester::new(&path, Arc::new(from_beginning()), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        assert_eq!(next(&mut running.events).await.offset, 0);
        assert_eq!(next(&mut running.events).await.offset, 18);

        std::fs::write(&path, b"short\n").unwrap();

        let e = next(&mut running.events).await;
        assert_eq!(e.text, b"short");
        assert_eq!(e.offset, 0);

        running.cancel.cancel();
        let exit = running.handle.await.unwrap().unwrap();
        assert_eq!(exit.offset, 6);
    }

    #[tokio::test]
    async fn test_truncation_flushes_multiline_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"START one\n  detail\n");

        let config = FileConfig {
            multiline: Some(MultilineConfig {
                pattern: Regex::new("^START").unwrap(),
                leader: true,
                max_lines: 10,
            }),
            ..from_beginning()
        };
        let harvester = Harvester::new(&path, Arc::new(config), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        // Let the harvester buffer both lines and go idle once
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(&path, b"START two\n").unwrap();

        let first = next(&mut running.events).await;
        assert_eq!(first.text, b"START one\n  detail");
        assert_eq!((first.offset, first.len), (0, 19));

        // The new leader stays buffered until shutdown flushes it
        tokio::time::sleep(Duration::from_millis(300)).await;
        running.cancel.cancel();
        let second = next(&mut running.events).await;
        assert_eq!(second.text, b"START two");
        assert_eq!(second.offset, 0);
    }

    #[tokio::test]
    async fn test_dead_time_stops_harvester() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"only line\n");

        let config = FileConfig {
            dead_time: Duration::from_millis(300),
            ..from_beginning()
        };
        let harvester = Harvester::new(&path, Arc::new(config), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        let e = next(&mut running.events).await;
        let read_at = std::time::Instant::now();
        assert_eq!(e.text, b"only line");

        let exit = tokio::time::timeout(TEST_TIMEOUT, running.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit.reason, ExitReason::Dead);
        assert_eq!(exit.offset, 10);
        assert_eq!(running.finished.await.unwrap(), 10);

        // dead time plus one read timeout, with slack for scheduling
        assert!(read_at.elapsed() < Duration::from_millis(300 + 100 + 500));
    }

    #[tokio::test]
    async fn test_dead_time_flushes_multiline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"a\ncont1\ncont2\nb\n");

        let config = FileConfig {
            dead_time: Duration::from_millis(150),
            multiline: Some(MultilineConfig {
                pattern: Regex::new("^cont").unwrap(),
                leader: false,
                max_lines: 10,
            }),
            ..from_beginning()
        };
        let harvester = Harvester::new(&path, Arc::new(config), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        let first = next(&mut running.events).await;
        assert_eq!(first.text, b"a\ncont1\ncont2");
        assert_eq!(first.line, 4);

        let second = next(&mut running.events).await;
        assert_eq!(second.text, b"b");
        assert_eq!(second.offset, 14);
        assert_eq!(second.line, 4);

        let exit = running.handle.await.unwrap().unwrap();
        assert_eq!(exit.reason, ExitReason::Dead);
    }

    #[tokio::test]
    async fn test_directory_is_not_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();

        let harvester = Harvester::new(dir.path(), Arc::new(from_beginning()), 0)
            .with_timings(fast_timings());
        let running = spawn(harvester);

        let result = running.handle.await.unwrap();
        assert!(matches!(result, Err(Error::NotRegularFile(_))));
        assert_eq!(running.finished.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_retries_until_file_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.log");

        let harvester =
            Harvester::new(&path, Arc::new(from_beginning()), 0).with_timings(fast_timings());
        let mut running = spawn(harvester);

        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&path, b"finally\n");

        assert_eq!(next(&mut running.events).await.text, b"finally");
        running.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");

        let harvester = Harvester::new(&path, Arc::new(from_beginning()), 7)
            .with_timings(fast_timings());
        let running = spawn(harvester);

        running.cancel.cancel();
        let exit = running.handle.await.unwrap().unwrap();
        assert_eq!(exit.reason, ExitReason::Cancelled);
        assert_eq!(exit.offset, 7);
    }

    #[tokio::test]
    async fn test_closed_output_stops_harvester() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, b"x\n");

        let harvester =
            Harvester::new(&path, Arc::new(from_beginning()), 0).with_timings(fast_timings());
        let (tx, rx) = bounded(1);
        drop(rx);
        let (finished_tx, _finished) = oneshot::channel();

        let exit = harvester
            .harvest(tx, CancellationToken::new(), finished_tx)
            .await
            .unwrap();
        assert_eq!(exit.reason, ExitReason::OutputClosed);
    }
}
