// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;

use crate::harvester::FileConfig;
use crate::publisher::kafka::Template;

/// Message compression codec
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Convert to the string value expected by librdkafka
    pub fn to_kafka_value(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

/// Broker acknowledgement required before a message counts as sent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAcks {
    /// acks=0
    #[default]
    NoResponse,
    /// acks=1, the partition leader only
    WaitForLocal,
    /// acks=all, every in-sync replica
    WaitForAll,
}

impl RequiredAcks {
    /// Convert to the string value expected by librdkafka
    pub fn to_kafka_value(&self) -> &'static str {
        match self {
            RequiredAcks::NoResponse => "0",
            RequiredAcks::WaitForLocal => "1",
            RequiredAcks::WaitForAll => "all",
        }
    }
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_flush_frequency_ms() -> u64 {
    5
}

/// The `kafka` publisher section
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct KafkaSinkConfig {
    #[serde(alias = "broker_list")]
    pub brokers: Vec<String>,

    /// Topic template, `{{.field}}` placeholders name static fields
    #[serde(alias = "topic_id")]
    pub topic: String,

    /// Message key template. Without it the event hostname is used.
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default, alias = "compression_codec")]
    pub compression: Compression,

    #[serde(default)]
    pub required_acks: RequiredAcks,

    /// Broker acknowledgement timeout (request.timeout.ms)
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Producer batching delay (linger.ms)
    #[serde(default = "default_flush_frequency_ms")]
    pub flush_frequency_ms: u64,
}

impl KafkaSinkConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("kafka publisher needs at least one broker".to_string());
        }
        if self.topic.trim().is_empty() {
            return Err("kafka publisher needs a topic".to_string());
        }
        self.topic_template()?;
        self.key_template()?;
        Ok(())
    }

    pub fn topic_template(&self) -> Result<Template, String> {
        Template::parse(&self.topic)
    }

    pub fn key_template(&self) -> Result<Option<Template>, String> {
        self.key.as_deref().map(Template::parse).transpose()
    }

    /// Check that every topic placeholder resolves for every file source, so
    /// no event can end up with an incomplete topic name
    pub fn check_topic_fields<'a>(
        &self,
        files: impl IntoIterator<Item = &'a FileConfig>,
    ) -> Result<(), String> {
        let topic = self.topic_template()?;
        for file in files {
            for name in topic.fields() {
                let resolvable = match name {
                    "path" => true,
                    "hostname" => file.event_hostname().is_some(),
                    _ => file.fields.contains_key(name),
                };
                if !resolvable {
                    return Err(format!(
                        "topic {:?} uses {:?}, which is not a field of the files {:?}",
                        self.topic, name, file.paths
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build rdkafka ClientConfig from this configuration
    #[cfg(feature = "rdkafka")]
    pub fn build_client_config(&self) -> rdkafka::ClientConfig {
        let mut config = rdkafka::ClientConfig::new();

        config.set("bootstrap.servers", self.brokers.join(","));
        config.set("client.id", env!("CARGO_PKG_NAME"));
        config.set("acks", self.required_acks.to_kafka_value());
        config.set("compression.type", self.compression.to_kafka_value());
        config.set("request.timeout.ms", self.ack_timeout_ms.to_string());
        config.set("linger.ms", self.flush_frequency_ms.to_string());

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: KafkaSinkConfig =
            serde_json::from_str(r#"{"brokers": ["k1:9092", "k2:9092"], "topic": "logs"}"#)
                .unwrap();
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.required_acks, RequiredAcks::NoResponse);
        assert_eq!(config.ack_timeout_ms, 30_000);
        assert!(config.key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_legacy_key_names() {
        let config: KafkaSinkConfig = serde_json::from_str(
            r#"{
                "broker_list": ["k1:9092"],
                "topic_id": "logs",
                "compression_codec": "snappy",
                "required_acks": "wait_for_all",
                "key": "web"
            }"#,
        )
        .unwrap();
        assert_eq!(config.topic, "logs");
        assert_eq!(config.compression.to_kafka_value(), "snappy");
        assert_eq!(config.required_acks.to_kafka_value(), "all");
        assert_eq!(config.key.as_deref(), Some("web"));
    }

    #[test]
    fn test_acks_mapping() {
        assert_eq!(RequiredAcks::NoResponse.to_kafka_value(), "0");
        assert_eq!(RequiredAcks::WaitForLocal.to_kafka_value(), "1");
        assert_eq!(RequiredAcks::WaitForAll.to_kafka_value(), "all");
    }

    #[test]
    fn test_validation() {
        let config = KafkaSinkConfig {
            brokers: vec![],
            topic: "logs".to_string(),
            key: None,
            compression: Compression::default(),
            required_acks: RequiredAcks::default(),
            ack_timeout_ms: 1,
            flush_frequency_ms: 1,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_templates_are_validated() {
        let mut config: KafkaSinkConfig =
            serde_json::from_str(r#"{"brokers": ["k1:9092"], "topic": "logs-{{.type"}"#).unwrap();
        assert!(config.validate().is_err());

        config.topic = "logs-{{.type}}".to_string();
        config.key = Some("{{host}}".to_string());
        assert!(config.validate().is_err());

        config.key = Some("{{.hostname}}-{{.path}}".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topic_fields_must_exist_for_every_source() {
        let config: KafkaSinkConfig =
            serde_json::from_str(r#"{"brokers": ["k1:9092"], "topic": "logs-{{.type}}"}"#)
                .unwrap();

        let mut nginx = FileConfig::default();
        nginx.fields.insert("type".to_string(), "nginx".to_string());
        assert!(config.check_topic_fields([&nginx]).is_ok());

        let plain = FileConfig::default();
        assert!(config.check_topic_fields([&nginx, &plain]).is_err());
    }

    #[cfg(feature = "rdkafka")]
    #[test]
    fn test_client_config() {
        let config: KafkaSinkConfig = serde_json::from_str(
            r#"{"brokers": ["k1:9092", "k2:9092"], "topic": "logs", "required_acks": "wait_for_local"}"#,
        )
        .unwrap();
        let client = config.build_client_config();
        assert_eq!(client.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(client.get("acks"), Some("1"));
    }
}
