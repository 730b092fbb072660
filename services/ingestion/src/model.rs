//! Domain types for measurements and the station/sensor catalog.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

use crate::broker::BrokerError;
use crate::error::IngestError;

/// Message type header attached to every measurement event
pub const MEASUREMENT_MESSAGE_TYPE: &str = "traffic_measurement";

/// Measurement creation payload, as submitted by a station.
///
/// This is also the event body published to the broker: consumers see what
/// the station sent, not the stored row. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMeasurement {
    pub sensor_id: i64,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub vehicle_count: Option<i32>,
}

impl NewMeasurement {
    pub fn new(sensor_id: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sensor_id,
            timestamp,
            speed: None,
            vehicle_count: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_vehicle_count(mut self, count: i32) -> Self {
        self.vehicle_count = Some(count);
        self
    }

    /// Parse and validate an untyped JSON payload.
    pub fn from_json(value: serde_json::Value) -> Result<Self, IngestError> {
        let measurement: NewMeasurement = serde_json::from_value(value)
            .map_err(|e| IngestError::Validation(format!("malformed measurement: {e}")))?;
        measurement.validate()?;
        Ok(measurement)
    }

    /// Check value ranges that the type system does not express.
    pub fn validate(&self) -> Result<(), IngestError> {
        if let Some(speed) = self.speed {
            if !speed.is_finite() {
                return Err(IngestError::Validation(format!(
                    "speed must be a finite number, got {speed}"
                )));
            }
        }

        if let Some(count) = self.vehicle_count {
            if count < 0 {
                return Err(IngestError::Validation(format!(
                    "vehicle_count must be non-negative, got {count}"
                )));
            }
        }

        Ok(())
    }

    /// Partition key for the broker: the decimal sensor id.
    pub fn partition_key(&self) -> String {
        self.sensor_id.to_string()
    }
}

/// RFC 3339 timestamps, or ISO 8601 without an offset read as UTC
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
}

/// A persisted measurement row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Measurement {
    pub id: i64,
    pub sensor_id: i64,
    pub timestamp: DateTime<Utc>,
    pub speed: Option<f64>,
    pub vehicle_count: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Measurement {
    /// The creation payload this row was stored from.
    pub fn payload(&self) -> NewMeasurement {
        NewMeasurement {
            sensor_id: self.sensor_id,
            timestamp: self.timestamp,
            speed: self.speed,
            vehicle_count: self.vehicle_count,
        }
    }
}

/// Body of a batch ingestion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchIngestRequest {
    pub measurements: Vec<NewMeasurement>,
}

/// A batch item whose event did not reach the broker
#[derive(Debug)]
pub struct PublishFailure {
    /// Position of the item in the submitted batch
    pub index: usize,
    pub sensor_id: i64,
    pub error: BrokerError,
}

/// Outcome of a batch ingestion whose storage write committed
#[derive(Debug)]
pub struct BatchResult {
    /// Number of rows persisted
    pub stored: usize,
    /// The persisted rows, in submission order
    pub measurements: Vec<Measurement>,
    /// Items whose publish failed, in submission order
    pub publish_failures: Vec<PublishFailure>,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self {
            stored: 0,
            measurements: Vec::new(),
            publish_failures: Vec::new(),
        }
    }

    /// Indices of the items whose publish failed
    pub fn failed_indices(&self) -> Vec<usize> {
        self.publish_failures.iter().map(|f| f.index).collect()
    }

    pub fn fully_published(&self) -> bool {
        self.publish_failures.is_empty()
    }
}

/// A monitoring station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Station {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStation {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl NewStation {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            city: None,
            latitude: None,
            longitude: None,
        }
    }
}

/// Sensor status value for sensors in service
pub const SENSOR_STATUS_ACTIVE: &str = "active";

/// A sensor mounted on a station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Sensor {
    pub id: i64,
    /// Unique external code
    pub code: String,
    pub station_id: i64,
    pub measurement_type: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSensor {
    pub code: String,
    pub station_id: i64,
    #[serde(default)]
    pub measurement_type: Option<String>,
    #[serde(default = "default_sensor_status")]
    pub status: String,
}

impl NewSensor {
    pub fn new(code: impl Into<String>, station_id: i64) -> Self {
        Self {
            code: code.into(),
            station_id,
            measurement_type: None,
            status: default_sensor_status(),
        }
    }

    pub fn with_measurement_type(mut self, measurement_type: impl Into<String>) -> Self {
        self.measurement_type = Some(measurement_type.into());
        self
    }
}

fn default_sensor_status() -> String {
    SENSOR_STATUS_ACTIVE.to_string()
}

/// A manually reported occurrence (accident, roadwork, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserEvent {
    pub id: i64,
    pub station_id: Option<i64>,
    pub kind: String,
    pub description: Option<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUserEvent {
    #[serde(default)]
    pub station_id: Option<i64>,
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    pub reported_at: DateTime<Utc>,
}
