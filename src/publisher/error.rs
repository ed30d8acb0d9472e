// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[cfg(feature = "rdkafka")]
    #[error("Kafka producer error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

#[cfg(feature = "rdkafka")]
impl From<(rdkafka::error::KafkaError, rdkafka::message::OwnedMessage)> for PublishError {
    fn from((error, _): (rdkafka::error::KafkaError, rdkafka::message::OwnedMessage)) -> Self {
        PublishError::Kafka(error)
    }
}
