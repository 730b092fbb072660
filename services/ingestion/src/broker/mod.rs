//! Message broker client.
//!
//! `BrokerClient` owns one producer session and its lifecycle
//! (`Uninitialized -> Ready -> Closed`). The transport behind it is a
//! [`ProducerBackend`] obtained from a [`Connector`], so the Kafka producer
//! can be swapped for the in-process [`RecordingBroker`] in tests.
//!
//! Publishing serializes the value as JSON, waits for the broker ack with a
//! bounded timeout, and retries transient failures with exponential backoff.

mod kafka;
mod recording;

pub use kafka::{KafkaBackend, KafkaConnector};
pub use recording::{CapturedMessage, RecordingBroker};

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::KafkaConfig;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to create producer: {0}")]
    Creation(String),

    #[error("Failed to serialize message for topic {topic}: {message}")]
    Serialization { topic: String, message: String },

    #[error("Failed to send message to topic {topic} (key {key:?}): {message}")]
    Send {
        topic: String,
        key: Option<String>,
        message: String,
    },

    #[error("Publish to topic {topic} (key {key:?}) timed out after {after:?}")]
    Timeout {
        topic: String,
        key: Option<String>,
        after: Duration,
    },

    #[error("Failed to flush producer: {0}")]
    Flush(String),

    #[error("Cannot {operation} while broker client is {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },
}

impl BrokerError {
    /// Whether retrying the same publish may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Send { .. } | BrokerError::Timeout { .. })
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, BrokerError::IllegalState { .. })
    }
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Message to be sent to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partition key
    pub key: Option<String>,
    /// Serialized payload
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        value: &T,
    ) -> Result<Self, BrokerError> {
        let topic = topic.into();
        let payload = serde_json::to_vec(value).map_err(|e| BrokerError::Serialization {
            topic: topic.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            topic,
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// A live producer session. Implementations must allow concurrent sends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProducerBackend: Send + Sync {
    /// Send one message and wait for the broker acknowledgement
    async fn send(
        &self,
        message: &OutgoingMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, BrokerError>;

    /// Deliver everything still in flight
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Opens producer sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ProducerBackend>, BrokerError>;
}

/// Timeout and retry policy for publishing
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    /// Upper bound on one publish attempt
    pub request_timeout: Duration,
    /// Retries after the first failed attempt
    pub retries: u32,
    /// First retry delay; later delays grow exponentially
    pub retry_backoff: Duration,
    /// Upper bound on draining in-flight messages at close
    pub flush_timeout: Duration,
}

impl PublishPolicy {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            retries: config.reliability.retries,
            retry_backoff: config.retry_backoff(),
            flush_timeout: config.flush_timeout(),
        }
    }

    /// Fail fast: one attempt, no retry
    pub fn no_retry(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            retries: 0,
            ..Default::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.retry_backoff,
            current_interval: self.retry_backoff,
            max_interval: self.retry_backoff * 32,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self::from_config(&KafkaConfig::default())
    }
}

/// Lifecycle state of a broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Uninitialized,
    Ready,
    Closed,
}

impl BrokerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerState::Uninitialized => "uninitialized",
            BrokerState::Ready => "ready",
            BrokerState::Closed => "closed",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Session {
    Uninitialized,
    Ready(Arc<dyn ProducerBackend>),
    Closed,
}

impl Session {
    fn state(&self) -> BrokerState {
        match self {
            Session::Uninitialized => BrokerState::Uninitialized,
            Session::Ready(_) => BrokerState::Ready,
            Session::Closed => BrokerState::Closed,
        }
    }
}

/// Broker client with an explicit `initialize` / `close` lifecycle.
///
/// Share it behind an `Arc`; all requests multiplex over the one session.
pub struct BrokerClient {
    connector: Arc<dyn Connector>,
    policy: PublishPolicy,
    session: RwLock<Session>,
}

impl BrokerClient {
    pub fn new(connector: Arc<dyn Connector>, policy: PublishPolicy) -> Self {
        Self {
            connector,
            policy,
            session: RwLock::new(Session::Uninitialized),
        }
    }

    /// Client backed by a Kafka producer built from `config`
    pub fn kafka(config: KafkaConfig) -> Self {
        let policy = PublishPolicy::from_config(&config);
        Self::new(Arc::new(KafkaConnector::new(config)), policy)
    }

    pub fn policy(&self) -> &PublishPolicy {
        &self.policy
    }

    pub async fn state(&self) -> BrokerState {
        self.session.read().await.state()
    }

    /// Open the producer session.
    ///
    /// The write lock is held across `connect`, so concurrent callers wait for
    /// the first one and then observe `Ready`. Fails after `close()`.
    pub async fn initialize(&self) -> Result<(), BrokerError> {
        let mut session = self.session.write().await;
        match *session {
            Session::Ready(_) => {
                debug!("Broker client already initialized");
                Ok(())
            }
            Session::Closed => Err(BrokerError::IllegalState {
                operation: "initialize",
                state: BrokerState::Closed.as_str(),
            }),
            Session::Uninitialized => {
                let backend = self.connector.connect().await?;
                *session = Session::Ready(backend);
                info!("Broker client ready");
                Ok(())
            }
        }
    }

    /// Fail with `IllegalState` unless the session is open.
    pub async fn ensure_ready(&self) -> Result<(), BrokerError> {
        self.ready_backend("publish").await.map(|_| ())
    }

    /// Serialize `value` as JSON and publish it to `topic`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &T,
    ) -> Result<DeliveryResult, BrokerError> {
        let mut message = OutgoingMessage::new_json(topic, value)?;
        message.key = key.map(str::to_string);
        self.publish_message(message).await
    }

    /// Publish a prepared message, retrying transient failures.
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn publish_message(
        &self,
        message: OutgoingMessage,
    ) -> Result<DeliveryResult, BrokerError> {
        let backend = self.ready_backend("publish").await?;
        let mut backoff = self.policy.backoff();
        let mut attempt = 0u32;

        loop {
            let result = match tokio::time::timeout(
                self.policy.request_timeout,
                backend.send(&message, self.policy.request_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout {
                    topic: message.topic.clone(),
                    key: message.key.clone(),
                    after: self.policy.request_timeout,
                }),
            };

            match result {
                Ok(delivery) => {
                    debug!(
                        partition = delivery.partition,
                        offset = delivery.offset,
                        attempts = attempt + 1,
                        "Message delivered"
                    );
                    return Ok(delivery);
                }
                Err(e) if e.is_transient() && attempt < self.policy.retries => {
                    attempt += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.policy.retry_backoff);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, attempts = attempt + 1, "Publish failed");
                    metrics::counter!("broker.publish.failed").increment(1);
                    return Err(e);
                }
            }
        }
    }

    /// Flush in-flight messages and release the session. Idempotent.
    pub async fn close(&self) -> Result<(), BrokerError> {
        let previous = {
            let mut session = self.session.write().await;
            std::mem::replace(&mut *session, Session::Closed)
        };

        match previous {
            Session::Ready(backend) => {
                info!("Closing broker client");
                backend.flush(self.policy.flush_timeout).await
            }
            Session::Uninitialized => {
                debug!("Broker client closed before initialization");
                Ok(())
            }
            Session::Closed => Ok(()),
        }
    }

    /// The backend only lives under the lock long enough to clone the handle.
    async fn ready_backend(
        &self,
        operation: &'static str,
    ) -> Result<Arc<dyn ProducerBackend>, BrokerError> {
        match &*self.session.read().await {
            Session::Ready(backend) => Ok(backend.clone()),
            other => Err(BrokerError::IllegalState {
                operation,
                state: other.state().as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockConnector {
        backend: Arc<dyn ProducerBackend>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Arc<dyn ProducerBackend>, BrokerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.backend.clone())
        }
    }

    fn client_with(backend: MockProducerBackend, retries: u32) -> BrokerClient {
        let connector = MockConnector {
            backend: Arc::new(backend),
            connects: AtomicUsize::new(0),
        };
        let policy = PublishPolicy {
            request_timeout: Duration::from_millis(200),
            retries,
            retry_backoff: Duration::from_millis(1),
            flush_timeout: Duration::from_millis(200),
        };
        BrokerClient::new(Arc::new(connector), policy)
    }

    fn delivered(message: &OutgoingMessage) -> DeliveryResult {
        DeliveryResult {
            topic: message.topic.clone(),
            partition: 0,
            offset: 1,
            key: message.key.clone(),
        }
    }

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage::new_json("traffic-measurements", &serde_json::json!({"a": 1}))
            .unwrap()
            .with_key("12")
            .with_message_type("traffic_measurement")
            .with_correlation_id("corr-123");

        assert_eq!(message.key.as_deref(), Some("12"));
        assert_eq!(message.payload, br#"{"a":1}"#.to_vec());
        assert_eq!(message.headers.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_before_initialize_is_illegal() {
        let client = client_with(MockProducerBackend::new(), 0);

        let err = client
            .publish("traffic-measurements", None, &1)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BrokerError::IllegalState {
                operation: "publish",
                state: "uninitialized"
            }
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut backend = MockProducerBackend::new();
        let mut calls = 0;
        backend.expect_send().times(3).returning(move |message, _| {
            calls += 1;
            if calls < 3 {
                Err(BrokerError::Send {
                    topic: message.topic.clone(),
                    key: message.key.clone(),
                    message: "broker transport failure".to_string(),
                })
            } else {
                Ok(delivered(message))
            }
        });

        let client = client_with(backend, 3);
        client.initialize().await.unwrap();

        let delivery = client
            .publish("traffic-measurements", Some("5"), &serde_json::json!({"speed": 1.0}))
            .await
            .unwrap();
        assert_eq!(delivery.key.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut backend = MockProducerBackend::new();
        backend.expect_send().times(2).returning(|message, _| {
            Err(BrokerError::Send {
                topic: message.topic.clone(),
                key: message.key.clone(),
                message: "broker down".to_string(),
            })
        });

        let client = client_with(backend, 1);
        client.initialize().await.unwrap();

        let err = client
            .publish("traffic-measurements", Some("5"), &1)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Send { .. }));
    }

    fn slow_client(broker: &RecordingBroker, retries: u32) -> BrokerClient {
        broker.set_latency(Duration::from_millis(200));
        BrokerClient::new(
            Arc::new(broker.clone()),
            PublishPolicy {
                request_timeout: Duration::from_millis(20),
                retries,
                retry_backoff: Duration::from_millis(1),
                flush_timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_slow_send_times_out() {
        let broker = RecordingBroker::new();
        let client = slow_client(&broker, 0);
        client.initialize().await.unwrap();

        let err = client
            .publish("traffic-measurements", Some("5"), &1)
            .await
            .unwrap_err();

        match err {
            BrokerError::Timeout { topic, key, after } => {
                assert_eq!(topic, "traffic-measurements");
                assert_eq!(key.as_deref(), Some("5"));
                assert_eq!(after, Duration::from_millis(20));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(broker.attempts(), 1);
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_are_retried() {
        let broker = RecordingBroker::new();
        let client = slow_client(&broker, 2);
        client.initialize().await.unwrap();

        let err = client
            .publish("traffic-measurements", Some("5"), &1)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::Timeout { .. }));
        assert_eq!(broker.attempts(), 3);
        assert!(broker.messages().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_ready_follows_state() {
        let client = client_with(MockProducerBackend::new(), 0);
        assert!(client.ensure_ready().await.unwrap_err().is_illegal_state());

        client.initialize().await.unwrap();
        client.ensure_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_flushes_once_and_is_terminal() {
        let mut backend = MockProducerBackend::new();
        backend.expect_flush().times(1).returning(|_| Ok(()));

        let client = client_with(backend, 0);
        client.initialize().await.unwrap();
        assert_eq!(client.state().await, BrokerState::Ready);

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state().await, BrokerState::Closed);

        assert!(client.initialize().await.unwrap_err().is_illegal_state());
        assert!(client
            .publish("traffic-measurements", None, &1)
            .await
            .unwrap_err()
            .is_illegal_state());
    }

    #[tokio::test]
    async fn test_concurrent_initialize_connects_once() {
        let connector = Arc::new(MockConnector {
            backend: Arc::new(MockProducerBackend::new()),
            connects: AtomicUsize::new(0),
        });
        let client = Arc::new(BrokerClient::new(
            connector.clone(),
            PublishPolicy::no_retry(Duration::from_millis(50)),
        ));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.initialize().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }
}
