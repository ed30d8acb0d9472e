// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::publisher::{EncodedEvent, PublishError, Sink};

/// Writes one JSON object per line to stdout or an appended file
pub struct WriterSink {
    name: &'static str,
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl WriterSink {
    pub fn new(name: &'static str, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            name,
            writer: BufWriter::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new("stdout", Box::new(tokio::io::stdout()))
    }

    /// Open `path` for appending, creating it when missing
    pub async fn file(path: impl AsRef<Path>) -> Result<Self, PublishError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        Ok(Self::new("file", Box::new(file)))
    }
}

#[async_trait]
impl Sink for WriterSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn publish(&mut self, batch: &[EncodedEvent]) -> Result<(), PublishError> {
        for event in batch {
            self.writer.write_all(&event.payload).await?;
            self.writer.write_all(b"\n").await?;
        }
        // A batch only counts as delivered once it left our buffer
        self.writer.flush().await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PublishError> {
        self.writer.flush().await?;
        Ok(())
    }
}
