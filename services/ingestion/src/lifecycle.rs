//! Broker client lifecycle.
//!
//! Two policies are supported:
//!
//! - [`SharedBroker`]: one process-wide client, initialized at startup and
//!   closed at shutdown. Every request shares it.
//! - [`scoped`]: a client created for one unit of work and closed when it
//!   ends, whether it returns, fails, panics or is cancelled.
//!
//! Either way no request ever observes an uninitialized client.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{BrokerClient, BrokerError, Connector, PublishPolicy};

/// Closes the client from `Drop` unless disarmed.
struct CloseGuard {
    client: Option<Arc<BrokerClient>>,
}

impl CloseGuard {
    fn new(client: Arc<BrokerClient>) -> Self {
        Self {
            client: Some(client),
        }
    }

    fn disarm(&mut self) {
        self.client = None;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.close().await {
                        warn!(error = %e, "Failed to close abandoned broker client");
                    }
                });
            }
            Err(_) => {
                warn!("Broker client dropped outside a runtime; in-flight messages may be lost");
            }
        }
    }
}

/// Process-wide broker client
pub struct SharedBroker {
    client: Arc<BrokerClient>,
    guard: CloseGuard,
}

impl SharedBroker {
    /// Create the client and initialize it before handing it out.
    pub async fn start(
        connector: Arc<dyn Connector>,
        policy: PublishPolicy,
    ) -> Result<Self, BrokerError> {
        let client = Arc::new(BrokerClient::new(connector, policy));
        client.initialize().await?;

        info!("Shared broker client started");
        Ok(Self {
            guard: CloseGuard::new(client.clone()),
            client,
        })
    }

    /// Handle for request handlers
    pub fn client(&self) -> Arc<BrokerClient> {
        self.client.clone()
    }

    /// Flush and close the client.
    pub async fn shutdown(mut self) -> Result<(), BrokerError> {
        info!("Shutting down shared broker client");
        let closed = self.client.close().await;
        self.guard.disarm();
        closed
    }
}

/// Run `work` with a freshly initialized client, closing it afterwards.
///
/// The client is closed on every exit path. A panic inside `work` is
/// re-raised once the client is closed; if the returned future is dropped
/// early the close runs on a spawned task.
pub async fn scoped<F, Fut, T, E>(
    connector: Arc<dyn Connector>,
    policy: PublishPolicy,
    work: F,
) -> Result<T, E>
where
    F: FnOnce(Arc<BrokerClient>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<BrokerError>,
{
    let client = Arc::new(BrokerClient::new(connector, policy));
    let mut guard = CloseGuard::new(client.clone());

    let outcome = match client.initialize().await {
        Ok(()) => AssertUnwindSafe(work(client.clone())).catch_unwind().await,
        Err(e) => Ok(Err(E::from(e))),
    };

    let closed = client.close().await;
    guard.disarm();

    match outcome {
        Err(panic) => std::panic::resume_unwind(panic),
        Ok(Ok(value)) => {
            closed.map_err(E::from)?;
            Ok(value)
        }
        Ok(Err(e)) => {
            if let Err(close_err) = closed {
                warn!(error = %close_err, "Failed to close scoped broker client");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerState, RecordingBroker};
    use std::time::Duration;

    fn policy() -> PublishPolicy {
        PublishPolicy::no_retry(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_shared_client_is_ready_until_shutdown() {
        let broker = RecordingBroker::new();
        let shared = SharedBroker::start(Arc::new(broker.clone()), policy())
            .await
            .unwrap();
        let client = shared.client();

        assert_eq!(client.state().await, BrokerState::Ready);
        client
            .publish("traffic-measurements", Some("1"), &serde_json::json!({"a": 1}))
            .await
            .unwrap();

        shared.shutdown().await.unwrap();
        assert_eq!(client.state().await, BrokerState::Closed);
        assert_eq!(broker.flush_count(), 1);
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_shared_client_still_closes() {
        let broker = RecordingBroker::new();
        let shared = SharedBroker::start(Arc::new(broker.clone()), policy())
            .await
            .unwrap();
        let client = shared.client();
        drop(shared);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state().await, BrokerState::Closed);
        assert_eq!(broker.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_scoped_closes_after_success_and_error() {
        let broker = RecordingBroker::new();

        let value: Result<u32, BrokerError> =
            scoped(Arc::new(broker.clone()), policy(), |client| async move {
                assert_eq!(client.state().await, BrokerState::Ready);
                Ok(7)
            })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert_eq!(broker.flush_count(), 1);

        let failed: Result<(), BrokerError> =
            scoped(Arc::new(broker.clone()), policy(), |_client| async move {
                Err(BrokerError::Flush("work failed".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(broker.flush_count(), 2);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_scoped_closes_on_panic() {
        let broker = RecordingBroker::new();

        let outcome = AssertUnwindSafe(scoped::<_, _, (), BrokerError>(
            Arc::new(broker.clone()),
            policy(),
            |_client| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(())
            },
        ))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(broker.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_scoped_closes_on_cancellation() {
        let broker = RecordingBroker::new();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            scoped::<_, _, (), BrokerError>(Arc::new(broker.clone()), policy(), |_client| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_scoped_cancelled_while_closing_still_closes() {
        let broker = RecordingBroker::new();
        broker.set_latency(Duration::from_millis(50));
        let seen = Arc::new(parking_lot::Mutex::new(None));

        let captured = seen.clone();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            scoped::<_, _, (), BrokerError>(Arc::new(broker.clone()), policy(), move |client| {
                *captured.lock() = Some(client);
                async { Ok(()) }
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let client = seen.lock().take().unwrap();
        assert_eq!(client.state().await, BrokerState::Closed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.flush_count(), 1);
    }
}
