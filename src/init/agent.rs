// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{info, warn};

use crate::bounded_channel::bounded;
use crate::harvester::{Event, HarvesterTimings};
use crate::init::args::AgentRun;
use crate::init::config::{self, PublisherConfig};
use crate::init::wait;
#[cfg(feature = "rdkafka")]
use crate::publisher::KafkaSink;
use crate::publisher::{Publisher, PublisherSettings, Sink, WriterSink};
use crate::prospector::{Prospector, ProspectorSettings};
use crate::registrar::{Ack, OffsetStore, Registrar};

const ACK_QUEUE_SIZE: usize = 16;

pub struct Agent {
    config: Box<AgentRun>,
    event_queue_size: usize,
    timings: HarvesterTimings,
}

impl Agent {
    pub fn new(config: Box<AgentRun>) -> Self {
        let event_queue_size = config.event_queue_size.max(1);
        Self {
            config,
            event_queue_size,
            timings: HarvesterTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: HarvesterTimings) -> Self {
        self.timings = timings;
        self
    }

    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let args = self.config;

        info!(config = ?args.config, "Starting logship.");

        let resolved = config::load(&args.config)?;
        let store = OffsetStore::open(&args.offsets_path)?;
        info!(
            files = resolved.files.len(),
            offsets = store.len(),
            offsets_path = ?args.offsets_path,
            "Loaded configuration"
        );

        let sink = build_sink(&resolved.publisher).await?;

        let mut prospector_task_set = JoinSet::new();
        let mut publisher_task_set = JoinSet::new();
        let mut registrar_task_set = JoinSet::new();

        let prospector_cancel = CancellationToken::new();
        let publisher_cancel = CancellationToken::new();

        let (events_tx, events_rx) = bounded::<Event>(self.event_queue_size);
        let (acks_tx, acks_rx) = bounded::<Ack>(ACK_QUEUE_SIZE);

        registrar_task_set.spawn(Registrar::new(store.clone(), acks_rx).run());

        let publisher = Publisher::new(
            sink,
            events_rx,
            acks_tx,
            PublisherSettings {
                spool_size: args.spool_size,
                idle_flush: args.idle_flush,
            },
        );
        publisher_task_set.spawn(publisher.run(publisher_cancel.clone()));

        let prospector = Prospector::new(
            resolved.files,
            store,
            events_tx,
            ProspectorSettings {
                scan_interval: args.scan_interval,
                tail_new_files: args.tail_new_files,
                timings: self.timings,
            },
        );
        prospector_task_set.spawn(prospector.run(prospector_cancel.clone()));

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                info!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut prospector_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of prospector."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut publisher_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of publisher."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut registrar_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of registrar."),
                    Err(e) => result = Err(e),
                }
            }
        }

        // Step one, stop the harvesters. Each flushes its pending record and
        // the event channel closes once the prospector has returned.
        prospector_cancel.cancel();
        let hard_stop = Instant::now() + Duration::from_secs(8);

        let res =
            wait::wait_for_tasks_with_timeout(&mut prospector_task_set, Duration::from_secs(2))
                .await;
        if let Err(e) = res {
            return Err(format!("timed out waiting for prospector exit: {}", e).into());
        }

        // The publisher drains the closed channel, give it a moment before
        // abandoning delivery retries
        let res =
            wait::wait_for_tasks_with_timeout(&mut publisher_task_set, Duration::from_secs(2))
                .await;
        if res.is_err() {
            warn!("Publisher did not exit on channel close, cancelling.");
            publisher_cancel.cancel();

            let res = wait::wait_for_tasks_with_deadline(&mut publisher_task_set, hard_stop).await;
            if let Err(e) = res {
                return Err(format!("timed out waiting for publisher to exit: {}", e).into());
            }
        }

        // The ack channel is closed now, the registrar persists what is left
        let res = wait::wait_for_tasks_with_deadline(&mut registrar_task_set, hard_stop).await;
        if let Err(e) = res {
            return Err(format!("timed out waiting for registrar to exit: {}", e).into());
        }

        result
    }
}

async fn build_sink(publisher: &PublisherConfig) -> Result<Box<dyn Sink>, BoxError> {
    match publisher {
        PublisherConfig::Stdout {} => Ok(Box::new(WriterSink::stdout())),
        PublisherConfig::File { path } => Ok(Box::new(WriterSink::file(path).await?)),
        #[cfg(feature = "rdkafka")]
        PublisherConfig::Kafka(kafka) => Ok(Box::new(KafkaSink::new(kafka.clone())?)),
        #[cfg(not(feature = "rdkafka"))]
        PublisherConfig::Kafka(_) => {
            Err("the kafka publisher requires building with the rdkafka feature".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_config_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let args = AgentRun {
            config: dir.path().join("missing.json"),
            offsets_path: dir.path().join("offsets.json"),
            tail_new_files: false,
            scan_interval: Duration::from_secs(1),
            spool_size: 10,
            idle_flush: Duration::from_secs(1),
            event_queue_size: 10,
        };

        let result = Agent::new(Box::new(args)).run(CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[cfg(not(feature = "rdkafka"))]
    #[tokio::test]
    async fn test_kafka_needs_feature() {
        let config = PublisherConfig::Kafka(
            serde_json::from_str(r#"{"brokers": ["k:9092"], "topic": "logs"}"#).unwrap(),
        );
        assert!(build_sink(&config).await.is_err());
    }
}
