// SPDX-License-Identifier: Apache-2.0

use std::io::{self, SeekFrom};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeek, AsyncSeekExt, BufReader};
use tokio::time::{Instant, sleep};

use crate::harvester::config::HarvesterTimings;

/// Read buffer size for harvested sources
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A unit of text produced by [`LineReader::read_line`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line content without terminator, only the head of a cut line
    pub text: Vec<u8>,
    /// Bytes consumed from the source, including any stripped terminator
    pub bytes: usize,
    /// True when the line exceeded the size cap
    pub cut: bool,
}

/// Result of waiting for one line
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(Line),
    /// No complete line arrived within the read timeout
    Idle,
}

/// Buffered newline reader with bounded waiting and a per-line size cap.
///
/// Bytes of an incomplete line are kept across [`ReadOutcome::Idle`] results,
/// so the sum of `bytes` over returned lines always equals the position in the
/// source. `read_line` is cancel safe: dropping the future at an await point
/// never loses consumed bytes.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    /// Bytes skipped after the cap was exceeded, `None` while not discarding
    discarded: Option<usize>,
    max_bytes: usize,
    read_timeout: std::time::Duration,
    idle_poll: std::time::Duration,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_bytes: usize, timings: &HarvesterTimings) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUFFER_SIZE, inner),
            buffer: Vec::new(),
            discarded: None,
            max_bytes: max_bytes.max(1),
            read_timeout: timings.read_timeout,
            idle_poll: timings.idle_poll,
        }
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Bytes of the current, still incomplete line
    pub fn pending(&self) -> usize {
        self.buffer.len() + self.discarded.unwrap_or_default()
    }

    /// Drop any partially read line
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarded = None;
    }

    /// Wait for the next complete line.
    ///
    /// A line longer than the cap comes back as a single cut unit holding its
    /// first `max_bytes + 1` bytes, with `bytes` covering the whole line up to
    /// and including its newline. The remainder is consumed without being
    /// buffered.
    ///
    /// Returns [`ReadOutcome::Idle`] once the source has stayed at end of
    /// stream for longer than the read timeout. Read errors other than end of
    /// stream are returned as-is.
    pub async fn read_line(&mut self) -> io::Result<ReadOutcome> {
        let start = Instant::now();

        loop {
            let available = self.reader.fill_buf().await?;

            if available.is_empty() {
                sleep(self.idle_poll).await;
                if start.elapsed() >= self.read_timeout {
                    return Ok(ReadOutcome::Idle);
                }
                continue;
            }

            if let Some(skipped) = self.discarded {
                match available.iter().position(|b| *b == b'\n') {
                    Some(idx) => {
                        self.reader.consume(idx + 1);
                        self.discarded = Some(skipped + idx + 1);
                        return Ok(ReadOutcome::Line(self.take_cut()));
                    }
                    None => {
                        let n = available.len();
                        self.reader.consume(n);
                        self.discarded = Some(skipped + n);
                        continue;
                    }
                }
            }

            // Never look further than one byte past the cap
            let room = self.max_bytes.saturating_add(1) - self.buffer.len();
            let window = &available[..available.len().min(room)];

            match window.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    self.buffer.extend_from_slice(&window[..=idx]);
                    self.reader.consume(idx + 1);
                    return Ok(ReadOutcome::Line(self.take_line()));
                }
                None => {
                    let n = window.len();
                    self.buffer.extend_from_slice(window);
                    self.reader.consume(n);

                    if self.buffer.len() > self.max_bytes {
                        self.discarded = Some(0);
                    }
                }
            }
        }
    }

    fn take_line(&mut self) -> Line {
        let bytes = self.buffer.len();
        let mut text = std::mem::take(&mut self.buffer);

        text.pop(); // '\n'
        if text.last() == Some(&b'\r') {
            text.pop();
        }

        Line {
            text,
            bytes,
            cut: false,
        }
    }

    fn take_cut(&mut self) -> Line {
        let text = std::mem::take(&mut self.buffer);
        Line {
            bytes: text.len() + self.discarded.take().unwrap_or_default(),
            text,
            cut: true,
        }
    }
}

impl<R: AsyncRead + AsyncSeek + Unpin> LineReader<R> {
    /// Reposition the source, discarding buffered and partial data
    pub async fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        self.reset();
        self.reader.seek(SeekFrom::Start(offset)).await
    }
}
