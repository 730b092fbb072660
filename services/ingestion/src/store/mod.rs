//! Durable storage for measurements and the station/sensor catalog.
//!
//! Two backends implement the same traits: [`PgStore`] over PostgreSQL and
//! [`MemoryStore`] for tests and local runs. Both give single-row atomic
//! inserts, all-or-nothing batch inserts and cascading deletes
//! (station → sensors → measurements, station → user events).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    Measurement, NewMeasurement, NewSensor, NewStation, NewUserEvent, Sensor, Station, UserEvent,
};

/// Errors raised by a store backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    /// A unique constraint was violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A foreign key points at a missing row
    #[error("Missing reference: {0}")]
    MissingReference(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence for measurement rows
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Persist one measurement, assigning `id` and `created_at`
    async fn insert(&self, measurement: &NewMeasurement) -> Result<Measurement>;

    /// Persist all measurements in one transaction; returns them in input order
    async fn insert_many(&self, measurements: &[NewMeasurement]) -> Result<Vec<Measurement>>;

    async fn get(&self, id: i64) -> Result<Option<Measurement>>;

    /// All measurements, ordered by id
    async fn list(&self) -> Result<Vec<Measurement>>;

    /// Cheap reachability check for readiness
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Referential lookup used before ingesting
#[async_trait]
pub trait SensorCatalog: Send + Sync {
    async fn sensor_exists(&self, sensor_id: i64) -> Result<bool>;
}

/// Catalog maintenance; deletes cascade to owned rows
#[async_trait]
pub trait CatalogStore: SensorCatalog {
    async fn create_station(&self, station: &NewStation) -> Result<Station>;

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor>;

    async fn create_user_event(&self, event: &NewUserEvent) -> Result<UserEvent>;

    async fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>>;

    async fn list_user_events(&self) -> Result<Vec<UserEvent>>;

    /// Delete a sensor and its measurements; false if it did not exist
    async fn delete_sensor(&self, sensor_id: i64) -> Result<bool>;

    /// Delete a station with its sensors, their measurements and its user events
    async fn delete_station(&self, station_id: i64) -> Result<bool>;
}
