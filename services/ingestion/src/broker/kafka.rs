//! Kafka transport built on rdkafka's `FutureProducer`.

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{BrokerError, Connector, DeliveryResult, OutgoingMessage, ProducerBackend};
use crate::config::KafkaConfig;

/// Producer session backed by librdkafka.
///
/// `FutureProducer` is internally reference counted and safe to share, so a
/// single backend serves every concurrent publish.
pub struct KafkaBackend {
    producer: FutureProducer,
}

impl KafkaBackend {
    pub fn new(config: &KafkaConfig) -> Result<Self, BrokerError> {
        info!("Creating Kafka producer for {}", config.bootstrap_servers);

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BrokerError::Creation(e.to_string()))?;

        Ok(Self { producer })
    }

    /// Number of messages waiting for delivery
    pub fn queue_len(&self) -> usize {
        self.producer.in_flight_count() as usize
    }
}

#[async_trait]
impl ProducerBackend for KafkaBackend {
    async fn send(
        &self,
        message: &OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, BrokerError> {
        let mut record = FutureRecord::to(&message.topic).payload(&message.payload);

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        if !message.headers.is_empty() {
            let headers = message
                .headers
                .iter()
                .fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key,
                        value: Some(value.as_str()),
                    })
                });
            record = record.headers(headers);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            message.topic,
            message.payload.len()
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(timeout))
            .await
            .map_err(|(e, _)| BrokerError::Send {
                topic: message.topic.clone(),
                key: message.key.clone(),
                message: e.to_string(),
            })?;

        Ok(DeliveryResult {
            topic: message.topic.clone(),
            partition,
            offset,
            key: message.key.clone(),
        })
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        // librdkafka's flush blocks the calling thread
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Flush(e.to_string()))?
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}

/// Opens `KafkaBackend` sessions from a fixed configuration
pub struct KafkaConnector {
    config: KafkaConfig,
}

impl KafkaConnector {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    async fn connect(&self) -> Result<Arc<dyn ProducerBackend>, BrokerError> {
        self.config
            .validate()
            .map_err(|e| BrokerError::Creation(e.to_string()))?;
        Ok(Arc::new(KafkaBackend::new(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connector_rejects_invalid_config() {
        let connector = KafkaConnector::new(KafkaConfig::new(""));
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, BrokerError::Creation(_)));
    }

    #[tokio::test]
    async fn test_backend_creation_does_not_need_a_live_broker() {
        let backend = KafkaBackend::new(&KafkaConfig::new("localhost:9092")).unwrap();
        assert_eq!(backend.queue_len(), 0);
    }
}
