// SPDX-License-Identifier: Apache-2.0

//! Multiline aggregation.
//!
//! Consecutive raw lines are merged into one logical record according to a
//! match pattern and a polarity:
//!
//! - leader: a matching line starts a new record, other lines are appended
//! - follower: a matching line is appended to the current record, any other
//!   line starts a new one
//!
//! The buffer never holds more than `max_lines` lines; reaching that count
//! flushes immediately.

use regex::bytes::Regex;

use crate::harvester::config::MultilineConfig;

/// A raw line together with its position in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub text: Vec<u8>,
    pub offset: u64,
    pub bytes: u64,
}

/// A flushed logical record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Lines joined with a single `\n`
    pub text: Vec<u8>,
    /// Offset of the first line
    pub offset: u64,
    /// Source bytes covered by all merged lines
    pub len: u64,
}

impl From<RawLine> for Record {
    fn from(line: RawLine) -> Self {
        Record {
            text: line.text,
            offset: line.offset,
            len: line.bytes,
        }
    }
}

/// Records completed by a single [`MultilineAggregator::push`], at most two
#[derive(Debug, Default)]
pub struct Flushed {
    first: Option<Record>,
    second: Option<Record>,
}

impl Iterator for Flushed {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.first.take().or_else(|| self.second.take())
    }
}

pub struct MultilineAggregator {
    pattern: Regex,
    leader: bool,
    capacity: usize,
    lines: Vec<RawLine>,
}

impl MultilineAggregator {
    pub fn new(config: &MultilineConfig) -> Self {
        let capacity = config.max_lines.max(1);
        Self {
            pattern: config.pattern.clone(),
            leader: config.leader,
            capacity,
            lines: Vec::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of buffered lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Feed one raw line, returning the records it completed
    pub fn push(&mut self, line: RawLine) -> Flushed {
        let matched = self.pattern.is_match(&line.text);
        let mut flushed = Flushed::default();

        // Leader: a match opens a record. Follower: a non-match does.
        let starts_record = matched == self.leader;
        if starts_record {
            flushed.first = self.flush();
        }

        self.lines.push(line);
        if self.lines.len() >= self.capacity {
            flushed.second = self.flush();
        }

        flushed
    }

    /// Flush whatever is buffered; an empty buffer yields nothing
    pub fn flush(&mut self) -> Option<Record> {
        if self.lines.is_empty() {
            return None;
        }

        let offset = self.lines[0].offset;
        let mut len = 0;
        let text_len =
            self.lines.iter().map(|l| l.text.len()).sum::<usize>() + self.lines.len() - 1;
        let mut text = Vec::with_capacity(text_len);

        for (idx, line) in self.lines.drain(..).enumerate() {
            if idx > 0 {
                text.push(b'\n');
            }
            text.extend_from_slice(&line.text);
            len += line.bytes;
        }

        Some(Record { text, offset, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(pattern: &str, leader: bool, max_lines: usize) -> MultilineAggregator {
        MultilineAggregator::new(&MultilineConfig {
            pattern: Regex::new(pattern).unwrap(),
            leader,
            max_lines,
        })
    }

    /// Feed lines with offsets as if each were newline-terminated
    fn feed(agg: &mut MultilineAggregator, lines: &[&str]) -> Vec<Record> {
        let mut offset = 0;
        let mut out = Vec::new();
        for l in lines {
            let bytes = l.len() as u64 + 1;
            out.extend(agg.push(RawLine {
                text: l.as_bytes().to_vec(),
                offset,
                bytes,
            }));
            offset += bytes;
        }
        out
    }

    fn texts(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8(r.text.clone()).unwrap())
            .collect()
    }

    #[test]
    fn test_leader_mode() {
        let mut agg = aggregator("^START", true, 10);
        let records = feed(&mut agg, &["START a", "b", "c", "START d"]);

        assert_eq!(texts(&records), vec!["START a\nb\nc"]);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[0].len, 8 + 2 + 2);

        let last = agg.flush().unwrap();
        assert_eq!(last.text, b"START d");
        assert_eq!(last.offset, 12);
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_follower_mode() {
        let mut agg = aggregator("^cont", false, 10);
        let records = feed(&mut agg, &["a", "cont1", "cont2", "b"]);

        assert_eq!(texts(&records), vec!["a\ncont1\ncont2"]);
        assert_eq!(agg.flush().unwrap().text, b"b");
    }

    #[test]
    fn test_capacity_forces_flush() {
        let mut agg = aggregator("^START", true, 2);
        let records = feed(&mut agg, &["START a", "b", "c", "d", "START e"]);

        assert_eq!(texts(&records), vec!["START a\nb", "c\nd"]);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn test_capacity_one_flushes_every_line() {
        let mut agg = aggregator("^cont", false, 1);
        let records = feed(&mut agg, &["a", "cont"]);

        assert_eq!(texts(&records), vec!["a", "cont"]);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_empty_flush_emits_nothing() {
        let mut agg = aggregator("^START", true, 10);
        assert!(agg.flush().is_none());

        let records = feed(&mut agg, &["START only"]);
        assert!(records.is_empty());
        assert!(agg.flush().is_some());
        assert!(agg.flush().is_none());
    }

    #[test]
    fn test_leader_mode_keeps_leading_orphans() {
        let mut agg = aggregator("^START", true, 10);
        let records = feed(&mut agg, &["orphan", "START a"]);

        assert_eq!(texts(&records), vec!["orphan"]);
    }
}
