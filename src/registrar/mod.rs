// SPDX-License-Identifier: Apache-2.0

//! Persistence of delivered offsets.
//!
//! The publisher sends one [`Ack`] per delivered batch. The [`Registrar`]
//! applies it to the [`OffsetStore`] and writes the store to disk, so a
//! restarted agent resumes each file after the last delivered record.

mod error;
mod store;

pub use error::{Error, Result};
pub use store::{FileState, OFFSETS_VERSION, OffsetStore};

use std::sync::Arc;
use tower::BoxError;
use tracing::{debug, error, info};

use crate::bounded_channel::BoundedReceiver;
use crate::harvester::Event;

/// Offsets reached by one delivered batch, one entry per source path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub offsets: Vec<(Arc<str>, u64)>,
}

impl Ack {
    /// Collect the end offset of the last event of every path. Standard
    /// input has no resumable offset and is skipped.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut offsets: Vec<(Arc<str>, u64)> = Vec::new();

        for event in events {
            if event.is_stdin() {
                continue;
            }
            match offsets.iter_mut().find(|(path, _)| *path == event.source) {
                Some(entry) => entry.1 = event.end_offset(),
                None => offsets.push((event.source.clone(), event.end_offset())),
            }
        }

        Self { offsets }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Consumes acks until every publisher has gone away
pub struct Registrar {
    store: OffsetStore,
    acks: BoundedReceiver<Ack>,
}

impl Registrar {
    pub fn new(store: OffsetStore, acks: BoundedReceiver<Ack>) -> Self {
        Self { store, acks }
    }

    pub async fn run(mut self) -> std::result::Result<(), BoxError> {
        info!(in_memory = self.store.is_memory(), "Starting registrar");

        while let Some(ack) = self.acks.next().await {
            if let Err(e) = self.apply(&ack) {
                // Keep going, the next ack rewrites the whole state
                error!(error = %e, "Failed to persist offsets");
            }
        }

        info!(files = self.store.len(), "Registrar stopped");
        Ok(())
    }

    fn apply(&self, ack: &Ack) -> Result<()> {
        if ack.is_empty() {
            return Ok(());
        }

        for (path, offset) in &ack.offsets {
            debug!(path = %path, offset, "Acknowledged offset");
            self.store.set_offset(path, *offset)?;
        }
        self.store.persist()
    }
}
