// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::harvester::config::{FileConfig, STDIN_PATH};

/// One logical record read from a harvested source.
///
/// The text is kept as raw bytes; invalid UTF-8 is only replaced when the
/// event is encoded.
#[derive(Clone)]
pub struct Event {
    /// Source path as configured (`-` for stdin)
    pub source: Arc<str>,
    /// Byte offset of the first byte of this record
    pub offset: u64,
    /// Number of source bytes covered by this record, terminators included
    pub len: u64,
    /// Raw line count of the harvester when the event was emitted
    pub line: u64,
    /// Raw or merged text
    pub text: Vec<u8>,
    /// Rules for field extraction and display
    pub config: Arc<FileConfig>,
    /// Read time, absent when the source suppresses timestamps
    pub timestamp: Option<DateTime<Utc>>,
}

impl Event {
    /// Offset just past this record, the resume point once it is delivered
    pub fn end_offset(&self) -> u64 {
        self.offset + self.len
    }

    /// Whether this event was read from standard input
    pub fn is_stdin(&self) -> bool {
        &*self.source == STDIN_PATH
    }

    pub fn hostname(&self) -> Option<&str> {
        self.config.event_hostname()
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("source", &self.source)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("line", &self.line)
            .field("text", &self.text_lossy())
            .finish()
    }
}
