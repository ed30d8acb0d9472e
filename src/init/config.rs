// SPDX-License-Identifier: Apache-2.0

//! Loading of the JSON configuration.
//!
//! Configuration is read in two phases. The file (or every file of a
//! directory) is parsed into a [`RawConfig`] that mirrors the JSON, the raw
//! configs are merged, and the result is resolved into immutable
//! [`FileConfig`]s with compiled patterns and parsed durations.

use gethostname::gethostname;
use indexmap::IndexMap;
use regex::bytes::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::harvester::config::{
    DEFAULT_DEAD_TIME, DEFAULT_MAX_BYTES, DEFAULT_MULTILINE_MAX_LINES, MultilineConfig,
};
use crate::harvester::{FileConfig, StartAt};
use crate::publisher::kafka::KafkaSinkConfig;

/// Config files above this size are rejected
pub const CONFIG_FILE_SIZE_LIMIT: u64 = 10 << 20;

/// Delimiter used when field names are given without one
pub const DEFAULT_DELIMITER: &str = r"\s+";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file {path} is {size} bytes, above the {limit} byte limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Multiline section of a file entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawMultiline {
    pub pattern: String,
    #[serde(default = "default_leader")]
    pub leader: bool,
    #[serde(default)]
    pub max_lines: Option<usize>,
}

fn default_leader() -> bool {
    true
}

/// One entry of the `files` list, as written in the config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawFileConfig {
    pub paths: Vec<String>,
    pub fields: IndexMap<String, String>,
    pub fieldnames: Vec<String>,
    #[serde(alias = "ExactMatch")]
    pub exact_match: bool,
    #[serde(alias = "Delimiter")]
    pub delimiter: Option<String>,
    #[serde(alias = "QuoteChar")]
    pub quote_char: Option<String>,
    #[serde(alias = "DeadTime")]
    pub dead_time: Option<String>,
    #[serde(alias = "MaxBytes")]
    pub max_bytes: Option<usize>,
    pub multiline: Option<RawMultiline>,
    #[serde(alias = "NoHostname")]
    pub no_hostname: bool,
    #[serde(alias = "NoPath")]
    pub no_path: bool,
    #[serde(alias = "NoTimestamp")]
    pub no_timestamp: bool,
    #[serde(alias = "HarvestFromBeginningOnNewFile")]
    pub harvest_from_beginning_on_new_file: bool,
}

/// Where encoded events go
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherConfig {
    Stdout {},
    File { path: PathBuf },
    Kafka(KafkaSinkConfig),
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig::Stdout {}
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub files: Vec<RawFileConfig>,
    pub publisher: Option<PublisherConfig>,
    /// Top-level Kafka section of older config files
    pub kafka: Option<KafkaSinkConfig>,
}

impl RawConfig {
    /// Append the file entries of `other`; its publisher replaces ours
    pub fn merge(&mut self, other: RawConfig) {
        self.files.extend(other.files);

        let publisher = other.publisher.or(other.kafka.map(PublisherConfig::Kafka));
        if publisher.is_some() {
            self.publisher = publisher;
            self.kafka = None;
        }
    }

    pub fn resolve(self, hostname: Option<String>) -> Result<ResolvedConfig> {
        if self.files.is_empty() {
            return Err(ConfigError::Invalid("no files configured".to_string()));
        }

        let files = self
            .files
            .into_iter()
            .map(|raw| resolve_file(raw, hostname.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let publisher = self
            .publisher
            .or(self.kafka.map(PublisherConfig::Kafka))
            .unwrap_or_default();
        if let PublisherConfig::Kafka(ref kafka) = publisher {
            kafka.validate().map_err(ConfigError::Invalid)?;
            kafka
                .check_topic_fields(files.iter().map(|f| &**f))
                .map_err(ConfigError::Invalid)?;
        }

        Ok(ResolvedConfig { files, publisher })
    }
}

/// Fully validated configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub files: Vec<Arc<FileConfig>>,
    pub publisher: PublisherConfig,
}

/// Load and resolve a config file or a directory of config files
pub fn load(path: impl AsRef<Path>) -> Result<ResolvedConfig> {
    let mut merged = RawConfig::default();

    for file in discover(path.as_ref())? {
        if let Some(raw) = load_file(&file)? {
            debug!(path = ?file, files = raw.files.len(), "Loaded config file");
            merged.merge(raw);
        }
    }

    merged.resolve(get_hostname())
}

/// List the config files named by `path`, sorted by name for directories
pub fn discover(path: &Path) -> Result<Vec<PathBuf>> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(path).map_err(io_err)?;
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Parse one config file. Empty files yield `None`.
pub fn load_file(path: &Path) -> Result<Option<RawConfig>> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    let size = fs::metadata(path).map_err(io_err)?.len();
    if size > CONFIG_FILE_SIZE_LIMIT {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit: CONFIG_FILE_SIZE_LIMIT,
        });
    }
    if size == 0 {
        warn!(path = ?path, "Config file is empty, skipping");
        return Ok(None);
    }

    let content = fs::read_to_string(path).map_err(io_err)?;
    // serde_json keeps the document order of static fields
    let raw = serde_json::from_str(&strip_comments(&content)).map_err(|source| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(Some(raw))
}

/// Remove every line whose first non-blank character is `#`
pub fn strip_comments(content: &str) -> String {
    content
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n")
}

fn resolve_file(raw: RawFileConfig, hostname: Option<String>) -> Result<FileConfig> {
    if raw.paths.is_empty() {
        return Err(ConfigError::Invalid(
            "every files entry needs at least one path".to_string(),
        ));
    }

    let dead_time = match raw.dead_time.as_deref() {
        None | Some("") => DEFAULT_DEAD_TIME,
        Some(s) => humantime::parse_duration(s)
            .map_err(|e| ConfigError::Invalid(format!("dead_time {:?}: {}", s, e)))?,
    };

    let delimiter = match raw.delimiter.as_deref() {
        Some(d) if !d.is_empty() => Some(compile(d)?),
        _ if !raw.fieldnames.is_empty() => Some(compile(DEFAULT_DELIMITER)?),
        _ => None,
    };

    let quote_char = match raw.quote_char.as_deref() {
        None | Some("") => None,
        Some(q) if q.len() == 1 && q.is_ascii() => Some(q.as_bytes()[0]),
        Some(q) => {
            return Err(ConfigError::Invalid(format!(
                "quote_char {:?} must be a single ASCII character",
                q
            )));
        }
    };

    let multiline = raw
        .multiline
        .map(|m| {
            Ok::<_, ConfigError>(MultilineConfig {
                pattern: compile(&m.pattern)?,
                leader: m.leader,
                max_lines: m.max_lines.unwrap_or(DEFAULT_MULTILINE_MAX_LINES),
            })
        })
        .transpose()?;

    let start_at = if raw.harvest_from_beginning_on_new_file {
        StartAt::Beginning
    } else {
        StartAt::End
    };

    let config = FileConfig {
        paths: raw.paths,
        fields: raw.fields,
        field_names: raw.fieldnames,
        delimiter,
        exact_match: raw.exact_match,
        quote_char,
        dead_time,
        max_bytes: raw.max_bytes.unwrap_or(DEFAULT_MAX_BYTES),
        multiline,
        hostname: if raw.no_hostname { None } else { hostname },
        no_hostname: raw.no_hostname,
        no_path: raw.no_path,
        no_timestamp: raw.no_timestamp,
        start_at,
    };

    config
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(config)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| ConfigError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

fn get_hostname() -> Option<String> {
    match gethostname().into_string() {
        Ok(s) => Some(s),
        Err(e) => {
            error!(error = ?e, "Unable to lookup hostname");
            None
        }
    }
}
