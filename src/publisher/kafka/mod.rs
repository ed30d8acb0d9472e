// SPDX-License-Identifier: Apache-2.0

//! Kafka delivery. The configuration types are always available so a config
//! file naming Kafka can be parsed and rejected with a clear message when the
//! `rdkafka` feature is off.

mod config;
#[cfg(feature = "rdkafka")]
mod sink;
mod template;

pub use config::{Compression, KafkaSinkConfig, RequiredAcks};
pub use template::Template;
#[cfg(feature = "rdkafka")]
pub use sink::KafkaSink;
