// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use crate::publisher::kafka::{KafkaSinkConfig, Template};
use crate::publisher::{EncodedEvent, PublishError, Sink};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces every event as one Kafka message
pub struct KafkaSink {
    config: KafkaSinkConfig,
    topic: Template,
    key: Option<Template>,
    producer: FutureProducer,
}

impl Debug for KafkaSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSink")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl KafkaSink {
    pub fn new(config: KafkaSinkConfig) -> Result<Self, PublishError> {
        config.validate().map_err(PublishError::Configuration)?;
        let topic = config
            .topic_template()
            .map_err(PublishError::Configuration)?;
        let key = config.key_template().map_err(PublishError::Configuration)?;

        let producer: FutureProducer = config.build_client_config().create().map_err(|e| {
            PublishError::Configuration(format!("Failed to create producer: {}", e))
        })?;

        info!(
            brokers = ?config.brokers,
            topic = %config.topic,
            "Created Kafka producer"
        );
        Ok(Self {
            config,
            topic,
            key,
            producer,
        })
    }
}

impl KafkaSink {
    /// Topic and key of the message carrying `event`
    fn route(&self, event: &EncodedEvent) -> (String, String) {
        let topic = self.topic.render(|name| event.field(name));
        let key = match self.key {
            Some(ref key) => key.render(|name| event.field(name)),
            None => event.hostname.clone().unwrap_or_default(),
        };
        (topic, key)
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn publish(&mut self, batch: &[EncodedEvent]) -> Result<(), PublishError> {
        let timeout = Timeout::After(Duration::from_millis(self.config.ack_timeout_ms));
        let mut sends = FuturesUnordered::new();

        // Records borrow their topic and key until delivery completes
        let routes: Vec<(String, String)> = batch.iter().map(|e| self.route(e)).collect();

        for (event, (topic, key)) in batch.iter().zip(routes.iter()) {
            let mut record = FutureRecord::to(topic)
                .key(key.as_str())
                .payload(event.payload.as_slice());
            if let Some(ts) = event.timestamp {
                record = record.timestamp(ts.timestamp_millis());
            }
            sends.push(self.producer.send(record, timeout));
        }

        // Every message has to land, otherwise the whole batch is retried
        let mut result = Ok(());
        while let Some(sent) = sends.next().await {
            match sent {
                Ok(delivery) => {
                    debug!(
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "Message delivered"
                    );
                }
                Err(e) => result = Err(PublishError::from(e)),
            }
        }
        result
    }

    async fn flush(&mut self) -> Result<(), PublishError> {
        self.producer.flush(Timeout::After(FLUSH_TIMEOUT))?;
        Ok(())
    }
}
