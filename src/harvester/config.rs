// SPDX-License-Identifier: Apache-2.0

//! Resolved, immutable per-file configuration consumed by harvesters.
//!
//! Values here are produced once by [`crate::init::config`] from the raw
//! configuration file and then shared read-only as `Arc<FileConfig>`.

use indexmap::IndexMap;
use regex::bytes::Regex;
use serde::Deserialize;
use std::time::Duration;

use crate::harvester::error::{Error, Result};

/// Path value that binds a harvester to the process's standard input
pub const STDIN_PATH: &str = "-";

/// Default idle time after which a file is considered finished
pub const DEFAULT_DEAD_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Default cap on a single unread line, in bytes
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024; // 1MB

/// Default number of raw lines a multiline record may buffer
pub const DEFAULT_MULTILINE_MAX_LINES: usize = 500;

/// Where to start reading a file that has no stored offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartAt {
    /// Replay the whole file
    Beginning,
    /// Only read content appended after the harvester opened the file
    #[default]
    End,
}

/// Multiline aggregation settings
#[derive(Debug, Clone)]
pub struct MultilineConfig {
    /// Lines matching this pattern start (leader) or continue (follower) a record
    pub pattern: Regex,
    /// Polarity: true when a matching line starts a new record
    pub leader: bool,
    /// Maximum number of raw lines buffered before a forced flush
    pub max_lines: usize,
}

/// Fully resolved configuration for one group of harvested files
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Path patterns (globs, or `-` for stdin)
    pub paths: Vec<String>,
    /// Static fields added to every event, in insertion order
    pub fields: IndexMap<String, String>,
    /// Names assigned positionally to delimiter-separated tokens
    pub field_names: Vec<String>,
    /// Token delimiter, required when `field_names` is non-empty
    pub delimiter: Option<Regex>,
    /// Only assign named fields when the token count matches exactly
    pub exact_match: bool,
    /// Quote character trimmed from both ends of each token
    pub quote_char: Option<u8>,
    /// Idle duration after which the harvester stops
    pub dead_time: Duration,
    /// Maximum bytes buffered for one line before it is force-cut
    pub max_bytes: usize,
    /// Optional multiline aggregation
    pub multiline: Option<MultilineConfig>,
    /// Hostname attached to events unless `no_hostname` is set
    pub hostname: Option<String>,
    pub no_hostname: bool,
    pub no_path: bool,
    pub no_timestamp: bool,
    /// Start position for files without a stored offset
    pub start_at: StartAt,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            fields: IndexMap::new(),
            field_names: Vec::new(),
            delimiter: None,
            exact_match: false,
            quote_char: None,
            dead_time: DEFAULT_DEAD_TIME,
            max_bytes: DEFAULT_MAX_BYTES,
            multiline: None,
            hostname: None,
            no_hostname: false,
            no_path: false,
            no_timestamp: false,
            start_at: StartAt::default(),
        }
    }
}

impl FileConfig {
    /// Validate the resolved configuration
    pub fn validate(&self) -> Result<()> {
        if !self.field_names.is_empty() && self.delimiter.is_none() {
            return Err(Error::Config(
                "a delimiter is required when fieldnames are set".to_string(),
            ));
        }

        if self.max_bytes == 0 {
            return Err(Error::Config("max_bytes must be positive".to_string()));
        }

        if let Some(ref multiline) = self.multiline {
            if multiline.max_lines == 0 {
                return Err(Error::Config(
                    "multiline max_lines must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Hostname to stamp on events, honoring the display flag
    pub fn event_hostname(&self) -> Option<&str> {
        if self.no_hostname {
            None
        } else {
            self.hostname.as_deref()
        }
    }
}

/// Fixed timing knobs of the harvest loop
#[derive(Debug, Clone, Copy)]
pub struct HarvesterTimings {
    /// Delay between failed open attempts
    pub open_backoff: Duration,
    /// Longest wait for one complete line before reporting idleness
    pub read_timeout: Duration,
    /// Sleep between end-of-stream retries inside one line wait
    pub idle_poll: Duration,
}

impl Default for HarvesterTimings {
    fn default() -> Self {
        Self {
            open_backoff: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            idle_poll: Duration::from_secs(1),
        }
    }
}
