//! In-process broker that records what was published.
//!
//! Used wherever a real broker is unavailable or unwanted: tests, local
//! development, dry runs. Failures can be injected per send attempt, per key,
//! or for the whole broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{BrokerError, Connector, DeliveryResult, OutgoingMessage, ProducerBackend};

/// A message the recording broker acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl CapturedMessage {
    /// Decode the payload as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct Recorded {
    messages: Vec<CapturedMessage>,
    attempts: usize,
    failing_attempts: HashSet<usize>,
    failing_keys: HashSet<String>,
    unavailable: bool,
    latency: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    recorded: Mutex<Recorded>,
    connects: AtomicUsize,
    flushes: AtomicUsize,
}

/// Recording broker handle; clones share state.
#[derive(Clone, Default)]
pub struct RecordingBroker {
    inner: Arc<Inner>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th send attempt (0-based, counted across all sends)
    pub fn fail_attempt(&self, n: usize) {
        self.inner.recorded.lock().failing_attempts.insert(n);
    }

    /// Fail every send carrying this partition key
    pub fn fail_key(&self, key: impl Into<String>) {
        self.inner.recorded.lock().failing_keys.insert(key.into());
    }

    /// Fail every send while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.recorded.lock().unavailable = unavailable;
    }

    /// Delay every acknowledgement and flush
    pub fn set_latency(&self, latency: Duration) {
        self.inner.recorded.lock().latency = Some(latency);
    }

    /// Acknowledged messages, in acknowledgement order
    pub fn messages(&self) -> Vec<CapturedMessage> {
        self.inner.recorded.lock().messages.clone()
    }

    pub fn messages_for(&self, topic: &str) -> Vec<CapturedMessage> {
        self.inner
            .recorded
            .lock()
            .messages
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Send attempts, including failed ones
    pub fn attempts(&self) -> usize {
        self.inner.recorded.lock().attempts
    }

    /// Sessions opened through the `Connector` impl
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.inner.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProducerBackend for RecordingBroker {
    async fn send(
        &self,
        message: &OutgoingMessage,
        _timeout: Duration,
    ) -> Result<DeliveryResult, BrokerError> {
        let (fail, latency) = {
            let mut recorded = self.inner.recorded.lock();
            let attempt = recorded.attempts;
            recorded.attempts += 1;

            let key_fails = message
                .key
                .as_ref()
                .is_some_and(|k| recorded.failing_keys.contains(k));
            let fail = recorded.unavailable
                || recorded.failing_attempts.contains(&attempt)
                || key_fails;
            (fail, recorded.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if fail {
            return Err(BrokerError::Send {
                topic: message.topic.clone(),
                key: message.key.clone(),
                message: "injected broker failure".to_string(),
            });
        }

        let mut recorded = self.inner.recorded.lock();
        let offset = recorded.messages.len() as i64;
        recorded.messages.push(CapturedMessage {
            topic: message.topic.clone(),
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        });

        Ok(DeliveryResult {
            topic: message.topic.clone(),
            partition: 0,
            offset,
            key: message.key.clone(),
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        let latency = self.inner.recorded.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for RecordingBroker {
    async fn connect(&self) -> Result<Arc<dyn ProducerBackend>, BrokerError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}
