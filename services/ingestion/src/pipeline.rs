//! Measurement ingestion: validate, store, publish.
//!
//! The store and the broker are written independently. A committed row is
//! never rolled back because its event failed to publish; the store is the
//! source of truth and missed events are recovered with
//! [`IngestionPipeline::republish`].
//!
//! Single ingest persists first and publishes second. Batch ingest publishes
//! every item first (collecting per-item failures) and then persists the
//! whole batch in one transaction.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerError, DeliveryResult, OutgoingMessage};
use crate::error::IngestError;
use crate::model::{
    BatchResult, Measurement, NewMeasurement, PublishFailure, MEASUREMENT_MESSAGE_TYPE,
};
use crate::store::{MeasurementStore, SensorCatalog, StoreError};
use crate::MEASUREMENTS_TOPIC;

/// Orchestrates the store and the broker for measurement ingestion
pub struct IngestionPipeline {
    store: Arc<dyn MeasurementStore>,
    catalog: Arc<dyn SensorCatalog>,
    broker: Arc<BrokerClient>,
    topic: String,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        catalog: Arc<dyn SensorCatalog>,
        broker: Arc<BrokerClient>,
    ) -> Self {
        Self {
            store,
            catalog,
            broker,
            topic: MEASUREMENTS_TOPIC.to_string(),
        }
    }

    /// Publish to a different topic
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn MeasurementStore> {
        &self.store
    }

    /// Ingest an untyped JSON payload, checking its shape first.
    pub async fn ingest_json(&self, payload: serde_json::Value) -> Result<Measurement, IngestError> {
        let measurement = NewMeasurement::from_json(payload)?;
        self.ingest(measurement).await
    }

    /// Store one measurement, then publish it.
    ///
    /// Returns the stored row only when both steps succeed. A publish
    /// failure returns [`IngestError::Publish`] carrying the committed row.
    /// A broker client that is not ready fails before anything is stored.
    #[instrument(skip(self, measurement), fields(sensor_id = measurement.sensor_id))]
    pub async fn ingest(&self, measurement: NewMeasurement) -> Result<Measurement, IngestError> {
        measurement.validate()?;
        self.ensure_sensor(measurement.sensor_id, None).await?;
        self.broker.ensure_ready().await.map_err(IngestError::IllegalState)?;

        let stored = match self.store.insert(&measurement).await {
            Ok(stored) => stored,
            // The sensor disappeared after the lookup
            Err(StoreError::MissingReference(_)) => {
                return Err(IngestError::Referential {
                    sensor_id: measurement.sensor_id,
                    index: None,
                })
            }
            Err(e) => {
                error!(error = %e, "Failed to store measurement");
                metrics::counter!("ingest.storage.failed").increment(1);
                return Err(IngestError::Storage(e));
            }
        };
        metrics::counter!("ingest.measurements.stored").increment(1);

        if let Err(e) = self.publish(&measurement).await {
            warn!(
                id = stored.id,
                topic = %self.topic,
                key = %measurement.partition_key(),
                error = %e,
                "Measurement stored but not published"
            );
            metrics::counter!("ingest.publish.failed").increment(1);
            return Err(IngestError::from_publish(e, Some(stored)));
        }
        metrics::counter!("ingest.measurements.published").increment(1);

        debug!(id = stored.id, "Measurement ingested");
        Ok(stored)
    }

    /// Publish every item, then store the whole batch atomically.
    ///
    /// Invalid items, unknown sensors or a broker client that is not ready
    /// reject the batch before any side effect. Publish failures are
    /// reported per item and never stop the batch; the call succeeds once
    /// the rows are committed.
    #[instrument(skip(self, measurements), fields(count = measurements.len()))]
    pub async fn ingest_batch(
        &self,
        measurements: Vec<NewMeasurement>,
    ) -> Result<BatchResult, IngestError> {
        if measurements.is_empty() {
            return Ok(BatchResult::empty());
        }

        for (index, measurement) in measurements.iter().enumerate() {
            measurement.validate().map_err(|e| match e {
                IngestError::Validation(msg) => {
                    IngestError::Validation(format!("batch item {index}: {msg}"))
                }
                other => other,
            })?;
        }

        let mut checked = HashSet::new();
        for (index, measurement) in measurements.iter().enumerate() {
            if checked.insert(measurement.sensor_id) {
                self.ensure_sensor(measurement.sensor_id, Some(index)).await?;
            }
        }
        self.broker.ensure_ready().await.map_err(IngestError::IllegalState)?;

        let mut publish_failures = Vec::new();
        for (index, measurement) in measurements.iter().enumerate() {
            if let Err(error) = self.publish(measurement).await {
                warn!(
                    index = index,
                    topic = %self.topic,
                    key = %measurement.partition_key(),
                    error = %error,
                    "Batch item not published"
                );
                publish_failures.push(PublishFailure {
                    index,
                    sensor_id: measurement.sensor_id,
                    error,
                });
            }
        }
        let published = measurements.len() - publish_failures.len();
        metrics::counter!("ingest.measurements.published").increment(published as u64);
        metrics::counter!("ingest.publish.failed").increment(publish_failures.len() as u64);

        let stored = match self.store.insert_many(&measurements).await {
            Ok(stored) => stored,
            Err(e) => {
                // The broker already carries these events with no backing rows
                error!(
                    error = %e,
                    orphaned_events = published,
                    "Failed to store measurement batch"
                );
                metrics::counter!("ingest.storage.failed").increment(1);
                return Err(match e {
                    StoreError::MissingReference(_) => {
                        self.locate_missing_sensor(&measurements, e).await
                    }
                    e => IngestError::Storage(e),
                });
            }
        };
        metrics::counter!("ingest.measurements.stored").increment(stored.len() as u64);

        info!(
            stored = stored.len(),
            publish_failures = publish_failures.len(),
            "Measurement batch ingested"
        );

        Ok(BatchResult {
            stored: stored.len(),
            measurements: stored,
            publish_failures,
        })
    }

    /// Publish a stored measurement again, for reconciliation after a
    /// failed publish.
    #[instrument(skip(self))]
    pub async fn republish(&self, id: i64) -> Result<DeliveryResult, IngestError> {
        let stored = self.get(id).await?;
        match self.publish(&stored.payload()).await {
            Ok(delivery) => {
                info!(id = id, "Measurement republished");
                Ok(delivery)
            }
            Err(e) => Err(IngestError::from_publish(e, Some(stored))),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Measurement, IngestError> {
        self.store.get(id).await?.ok_or(IngestError::NotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Measurement>, IngestError> {
        Ok(self.store.list().await?)
    }

    async fn ensure_sensor(&self, sensor_id: i64, index: Option<usize>) -> Result<(), IngestError> {
        if self.catalog.sensor_exists(sensor_id).await? {
            Ok(())
        } else {
            debug!(sensor_id = sensor_id, "Rejecting measurement for unknown sensor");
            Err(IngestError::Referential { sensor_id, index })
        }
    }

    /// Name the batch item whose sensor vanished between lookup and insert.
    async fn locate_missing_sensor(
        &self,
        measurements: &[NewMeasurement],
        cause: StoreError,
    ) -> IngestError {
        for (index, measurement) in measurements.iter().enumerate() {
            if let Ok(false) = self.catalog.sensor_exists(measurement.sensor_id).await {
                return IngestError::Referential {
                    sensor_id: measurement.sensor_id,
                    index: Some(index),
                };
            }
        }

        // Catalog and store disagree; a single-sensor batch is still unambiguous
        let first = measurements[0].sensor_id;
        if measurements.iter().all(|m| m.sensor_id == first) {
            IngestError::Referential {
                sensor_id: first,
                index: None,
            }
        } else {
            IngestError::Storage(cause)
        }
    }

    async fn publish(&self, measurement: &NewMeasurement) -> Result<DeliveryResult, BrokerError> {
        let message = OutgoingMessage::new_json(&self.topic, measurement)?
            .with_key(measurement.partition_key())
            .with_message_type(MEASUREMENT_MESSAGE_TYPE)
            .with_correlation_id(Uuid::new_v4().to_string());

        self.broker.publish_message(message).await
    }
}
