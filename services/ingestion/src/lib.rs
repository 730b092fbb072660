//! Traffic Ingestion - measurement intake for the traffic monitoring platform
//!
//! Stations submit speed and vehicle-count measurements. Each accepted
//! measurement is:
//!
//! - validated and checked against the sensor catalog
//! - stored durably in PostgreSQL (the source of truth)
//! - published to Kafka, keyed by sensor id, for downstream consumers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use traffic_ingestion::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let store = Arc::new(PgStore::new(&config.database).await?);
//!
//!     let broker = SharedBroker::start(
//!         Arc::new(KafkaConnector::new(config.kafka.clone())),
//!         PublishPolicy::from_config(&config.kafka),
//!     )
//!     .await?;
//!
//!     let pipeline = IngestionPipeline::new(store.clone(), store, broker.client());
//!     let stored = pipeline
//!         .ingest(NewMeasurement::new(1, chrono::Utc::now()).with_speed(50.5))
//!         .await?;
//!     println!("stored measurement {}", stored.id);
//!
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod broker;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod store;

/// Topic carrying measurement events
pub const MEASUREMENTS_TOPIC: &str = "traffic-measurements";

// Re-export main types
pub use auth::{AuthError, Authorizer, Principal, Role, StaticTokenAuthorizer};
pub use broker::{
    BrokerClient, BrokerError, BrokerState, CapturedMessage, Connector, DeliveryResult,
    KafkaBackend, KafkaConnector, OutgoingMessage, ProducerBackend, PublishPolicy,
    RecordingBroker,
};
pub use config::{Config, ConfigError, DatabaseConfig, KafkaConfig};
pub use error::{IngestError, Stage};
pub use lifecycle::{scoped, SharedBroker};
pub use model::{
    BatchIngestRequest, BatchResult, Measurement, NewMeasurement, NewSensor, NewStation,
    NewUserEvent, PublishFailure, Sensor, Station, UserEvent,
};
pub use pipeline::IngestionPipeline;
pub use store::{CatalogStore, MeasurementStore, MemoryStore, PgStore, SensorCatalog, StoreError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{BrokerClient, KafkaConnector, PublishPolicy};
    pub use crate::config::Config;
    pub use crate::error::IngestError;
    pub use crate::lifecycle::SharedBroker;
    pub use crate::model::{Measurement, NewMeasurement};
    pub use crate::pipeline::IngestionPipeline;
    pub use crate::store::{MeasurementStore, PgStore};
}
