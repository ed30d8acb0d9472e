// SPDX-License-Identifier: Apache-2.0

//! JSON file store of acknowledged offsets with atomic writes.
//!
//! The whole state is rewritten on every persist, to a temp file that is
//! renamed over the previous one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::prospector::FileId;
use crate::registrar::error::{Error, Result};

/// Current schema version of the offsets file
pub const OFFSETS_VERSION: u8 = 1;

/// Stored state for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Offset just past the last delivered record
    pub offset: u64,
    /// Identity of the file the offset belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FileId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetsState {
    version: u8,
    #[serde(default)]
    files: BTreeMap<String, FileState>,
}

impl Default for OffsetsState {
    fn default() -> Self {
        Self {
            version: OFFSETS_VERSION,
            files: BTreeMap::new(),
        }
    }
}

/// Shared handle to the offsets file
#[derive(Clone)]
pub struct OffsetStore {
    path: PathBuf,
    state: Arc<RwLock<OffsetsState>>,
}

impl OffsetStore {
    /// Open the store at `path`, loading it when it already exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| Error::Persistence(format!("failed to open offsets file: {}", e)))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| Error::Persistence(format!("failed to parse offsets file: {}", e)))?
        } else {
            OffsetsState::default()
        };

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// A store that never touches the disk
    pub fn open_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Arc::new(RwLock::new(OffsetsState::default())),
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    pub fn get(&self, path: &str) -> Option<FileState> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.files.get(path).copied())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record which file identity `path` currently refers to when a harvester
    /// starts reading it at `start`.
    ///
    /// For the file already stored under `path` the acknowledged offset can
    /// only move back (a truncated file restarts lower), never forward: bytes
    /// read before `start` may still be waiting for delivery. A new path or a
    /// replaced file starts out at `start`.
    pub fn track(&self, path: &str, id: FileId, start: u64) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let entry = state.files.entry(path.to_string()).or_insert(FileState {
            offset: start,
            id: Some(id),
        });
        match entry.id {
            Some(known) if known != id => entry.offset = start,
            _ => entry.offset = entry.offset.min(start),
        }
        entry.id = Some(id);
        Ok(())
    }

    /// Update the acknowledged offset of `path`, keeping its identity
    pub fn set_offset(&self, path: &str, offset: u64) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        state
            .files
            .entry(path.to_string())
            .and_modify(|f| f.offset = offset)
            .or_insert(FileState { offset, id: None });
        Ok(())
    }

    /// Write the current state to disk
    pub fn persist(&self) -> Result<()> {
        if self.is_memory() {
            return Ok(());
        }

        let state = self
            .state
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        atomic_write(&self.path, &state)
    }
}

/// Write state to file atomically (write to temp, then rename)
fn atomic_write(path: &Path, state: &OffsetsState) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    // Unique per process and write so concurrent persists never share a temp file
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state)?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush offsets file: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to rename offsets file: {}", e)))?;

    Ok(())
}
