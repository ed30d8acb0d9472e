// SPDX-License-Identifier: Apache-2.0

//! Batching and delivery of harvested events.
//!
//! The [`Publisher`] spools events from all harvesters, encodes them and hands
//! each full (or idle) spool to a [`Sink`]. After the sink accepts a batch an
//! [`Ack`] with the reached offsets goes to the registrar.
//!
//! The loop ends once every event sender is gone, so all events the
//! harvesters flushed on shutdown are still delivered.

mod error;
pub mod kafka;
mod writer;

pub use error::PublishError;
pub use writer::WriterSink;

#[cfg(feature = "rdkafka")]
pub use kafka::KafkaSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::harvester::{Event, FileConfig};
use crate::harvester::encoder;
use crate::registrar::Ack;

pub const DEFAULT_SPOOL_SIZE: usize = 1024;
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_secs(5);

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// An event rendered to its wire form
#[derive(Debug, Clone)]
pub struct EncodedEvent {
    pub source: Arc<str>,
    /// Single-line JSON object, no trailing newline
    pub payload: Vec<u8>,
    /// Hostname of the event, used as the default message key
    pub hostname: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Settings of the source, for static field lookups
    pub config: Arc<FileConfig>,
}

impl EncodedEvent {
    pub fn new(event: &Event) -> Self {
        Self {
            source: event.source.clone(),
            payload: encoder::encode_to_vec(event),
            hostname: event.hostname().map(str::to_string),
            timestamp: event.timestamp,
            config: event.config.clone(),
        }
    }

    /// Value of `path`, a static field, or `hostname`, in that order
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == "path" {
            return Some(&*self.source);
        }
        match self.config.fields.get(name) {
            Some(value) => Some(value.as_str()),
            None if name == "hostname" => self.hostname.as_deref(),
            None => None,
        }
    }
}

/// Destination of encoded batches
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &'static str;

    /// Deliver a whole batch. An error means nothing from the batch may be
    /// considered delivered.
    async fn publish(&mut self, batch: &[EncodedEvent]) -> Result<(), PublishError>;

    /// Called once before the publisher exits
    async fn flush(&mut self) -> Result<(), PublishError> {
        Ok(())
    }
}

#[async_trait]
impl Sink for Box<dyn Sink> {
    fn name(&self) -> &'static str {
        self.as_ref().name()
    }

    async fn publish(&mut self, batch: &[EncodedEvent]) -> Result<(), PublishError> {
        self.as_mut().publish(batch).await
    }

    async fn flush(&mut self) -> Result<(), PublishError> {
        self.as_mut().flush().await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherSettings {
    /// Events per batch
    pub spool_size: usize,
    /// Longest time a non-empty spool waits for more events
    pub idle_flush: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            spool_size: DEFAULT_SPOOL_SIZE,
            idle_flush: DEFAULT_IDLE_FLUSH,
        }
    }
}

pub struct Publisher<S> {
    sink: S,
    events: BoundedReceiver<Event>,
    acks: BoundedSender<Ack>,
    settings: PublisherSettings,
    spool: Vec<Event>,
}

impl<S: Sink> Publisher<S> {
    pub fn new(
        sink: S,
        events: BoundedReceiver<Event>,
        acks: BoundedSender<Ack>,
        settings: PublisherSettings,
    ) -> Self {
        let spool_size = settings.spool_size.max(1);
        Self {
            sink,
            events,
            acks,
            settings: PublisherSettings {
                spool_size,
                ..settings
            },
            spool: Vec::with_capacity(spool_size),
        }
    }

    /// Run until the event channel closes. `cancel` only aborts delivery
    /// retries, so a failing sink cannot block shutdown.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BoxError> {
        info!(
            sink = self.sink.name(),
            spool_size = self.settings.spool_size,
            idle_flush = %humantime::format_duration(self.settings.idle_flush),
            "Starting publisher"
        );

        let mut flush_at = Instant::now() + self.settings.idle_flush;

        loop {
            select! {
                event = self.events.next() => {
                    match event {
                        Some(event) => {
                            self.spool.push(event);
                            if self.spool.len() >= self.settings.spool_size {
                                self.publish_spool(&cancel).await;
                                flush_at = Instant::now() + self.settings.idle_flush;
                            }
                        }
                        None => {
                            debug!("Event channel closed, draining publisher");
                            break;
                        }
                    }
                }
                _ = sleep_until(flush_at) => {
                    if !self.spool.is_empty() {
                        self.publish_spool(&cancel).await;
                    }
                    flush_at = Instant::now() + self.settings.idle_flush;
                }
            }
        }

        if !self.spool.is_empty() {
            self.publish_spool(&cancel).await;
        }
        if let Err(e) = self.sink.flush().await {
            error!(sink = self.sink.name(), error = %e, "Failed to flush sink");
        }

        info!(sink = self.sink.name(), "Publisher stopped");
        Ok(())
    }

    async fn publish_spool(&mut self, cancel: &CancellationToken) {
        let spool = std::mem::replace(
            &mut self.spool,
            Vec::with_capacity(self.settings.spool_size),
        );

        let batch: Vec<EncodedEvent> = spool
            .iter()
            .filter(|event| {
                // Force-cut lines keep their first max_bytes + 1 bytes and are never shipped
                let oversized = event.text.len() > event.config.max_bytes;
                if oversized {
                    debug!(
                        path = %event.source,
                        offset = event.offset,
                        bytes = event.text.len(),
                        "Dropping oversized record"
                    );
                }
                !oversized
            })
            .map(EncodedEvent::new)
            .collect();

        if !batch.is_empty() && !self.deliver(&batch, cancel).await {
            return;
        }

        let ack = Ack::from_events(&spool);
        if ack.is_empty() {
            return;
        }
        if self.acks.send(ack).await.is_err() {
            warn!("Registrar is gone, offsets will not be persisted");
        }
    }

    /// Deliver with backoff until the sink accepts the batch. Returns false
    /// when retrying was abandoned because of cancellation.
    async fn deliver(&mut self, batch: &[EncodedEvent], cancel: &CancellationToken) -> bool {
        let mut backoff = RETRY_INITIAL_BACKOFF;

        loop {
            match self.sink.publish(batch).await {
                Ok(()) => {
                    debug!(sink = self.sink.name(), events = batch.len(), "Published batch");
                    return true;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        error!(
                            sink = self.sink.name(),
                            error = %e,
                            events = batch.len(),
                            "Failed to publish batch during shutdown, dropping it"
                        );
                        return false;
                    }
                    warn!(
                        sink = self.sink.name(),
                        error = %e,
                        retry_in = %humantime::format_duration(backoff),
                        "Failed to publish batch, will retry"
                    );
                    select! {
                        _ = cancel.cancelled() => {}
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                }
            }
        }
    }
}
