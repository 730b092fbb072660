use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{CatalogStore, MeasurementStore, Result, SensorCatalog, StoreError};
use crate::model::{
    Measurement, NewMeasurement, NewSensor, NewStation, NewUserEvent, Sensor, Station, UserEvent,
};

#[derive(Default)]
struct Tables {
    stations: BTreeMap<i64, Station>,
    sensors: BTreeMap<i64, Sensor>,
    measurements: BTreeMap<i64, Measurement>,
    user_events: BTreeMap<i64, UserEvent>,
    next_station_id: i64,
    next_sensor_id: i64,
    next_measurement_id: i64,
    next_user_event_id: i64,
    last_created_at: Option<DateTime<Utc>>,
}

impl Tables {
    /// Strictly increasing insertion timestamps
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_created_at {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(stamp);
        stamp
    }

    fn check_sensor(&self, sensor_id: i64) -> Result<()> {
        if self.sensors.contains_key(&sensor_id) {
            Ok(())
        } else {
            Err(StoreError::MissingReference(format!(
                "sensor {sensor_id} does not exist"
            )))
        }
    }

    fn insert_measurement(&mut self, measurement: &NewMeasurement) -> Measurement {
        self.next_measurement_id += 1;
        let stored = Measurement {
            id: self.next_measurement_id,
            sensor_id: measurement.sensor_id,
            timestamp: measurement.timestamp,
            speed: measurement.speed,
            vehicle_count: measurement.vehicle_count,
            created_at: self.stamp(),
        };
        self.measurements.insert(stored.id, stored.clone());
        stored
    }

    fn cascade_sensor(&mut self, sensor_id: i64) -> bool {
        if self.sensors.remove(&sensor_id).is_none() {
            return false;
        }
        self.measurements.retain(|_, m| m.sensor_id != sensor_id);
        true
    }
}

/// In-process store with the same contract as the PostgreSQL backend.
///
/// Every operation runs under one lock acquisition, which gives single-row
/// and batch atomicity. Foreign keys are enforced on insert.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `StoreError::Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn measurement_count(&self) -> usize {
        self.tables.read().measurements.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn insert(&self, measurement: &NewMeasurement) -> Result<Measurement> {
        self.check_available()?;
        let mut tables = self.tables.write();
        tables.check_sensor(measurement.sensor_id)?;
        Ok(tables.insert_measurement(measurement))
    }

    async fn insert_many(&self, measurements: &[NewMeasurement]) -> Result<Vec<Measurement>> {
        self.check_available()?;
        let mut tables = self.tables.write();
        for measurement in measurements {
            tables.check_sensor(measurement.sensor_id)?;
        }
        Ok(measurements
            .iter()
            .map(|m| tables.insert_measurement(m))
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<Measurement>> {
        Ok(self.tables.read().measurements.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Measurement>> {
        Ok(self.tables.read().measurements.values().cloned().collect())
    }

    async fn health_check(&self) -> Result<()> {
        self.check_available()
    }
}

#[async_trait]
impl SensorCatalog for MemoryStore {
    async fn sensor_exists(&self, sensor_id: i64) -> Result<bool> {
        Ok(self.tables.read().sensors.contains_key(&sensor_id))
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn create_station(&self, station: &NewStation) -> Result<Station> {
        self.check_available()?;
        let mut tables = self.tables.write();
        if tables.stations.values().any(|s| s.code == station.code) {
            return Err(StoreError::Conflict(format!(
                "station code {} already exists",
                station.code
            )));
        }

        tables.next_station_id += 1;
        let stored = Station {
            id: tables.next_station_id,
            code: station.code.clone(),
            name: station.name.clone(),
            city: station.city.clone(),
            latitude: station.latitude,
            longitude: station.longitude,
        };
        tables.stations.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor> {
        self.check_available()?;
        let mut tables = self.tables.write();
        if !tables.stations.contains_key(&sensor.station_id) {
            return Err(StoreError::MissingReference(format!(
                "station {} does not exist",
                sensor.station_id
            )));
        }
        if tables.sensors.values().any(|s| s.code == sensor.code) {
            return Err(StoreError::Conflict(format!(
                "sensor code {} already exists",
                sensor.code
            )));
        }

        tables.next_sensor_id += 1;
        let stored = Sensor {
            id: tables.next_sensor_id,
            code: sensor.code.clone(),
            station_id: sensor.station_id,
            measurement_type: sensor.measurement_type.clone(),
            status: sensor.status.clone(),
        };
        tables.sensors.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn create_user_event(&self, event: &NewUserEvent) -> Result<UserEvent> {
        self.check_available()?;
        let mut tables = self.tables.write();
        if let Some(station_id) = event.station_id {
            if !tables.stations.contains_key(&station_id) {
                return Err(StoreError::MissingReference(format!(
                    "station {station_id} does not exist"
                )));
            }
        }

        tables.next_user_event_id += 1;
        let stored = UserEvent {
            id: tables.next_user_event_id,
            station_id: event.station_id,
            kind: event.kind.clone(),
            description: event.description.clone(),
            reported_at: event.reported_at,
        };
        tables.user_events.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>> {
        Ok(self.tables.read().sensors.get(&sensor_id).cloned())
    }

    async fn list_user_events(&self) -> Result<Vec<UserEvent>> {
        Ok(self.tables.read().user_events.values().cloned().collect())
    }

    async fn delete_sensor(&self, sensor_id: i64) -> Result<bool> {
        self.check_available()?;
        Ok(self.tables.write().cascade_sensor(sensor_id))
    }

    async fn delete_station(&self, station_id: i64) -> Result<bool> {
        self.check_available()?;
        let mut tables = self.tables.write();
        if tables.stations.remove(&station_id).is_none() {
            return Ok(false);
        }

        let owned: Vec<i64> = tables
            .sensors
            .values()
            .filter(|s| s.station_id == station_id)
            .map(|s| s.id)
            .collect();
        for sensor_id in owned {
            tables.cascade_sensor(sensor_id);
        }
        tables
            .user_events
            .retain(|_, e| e.station_id != Some(station_id));

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryStore, Station, Sensor) {
        let store = MemoryStore::new();
        let station = store
            .create_station(&NewStation::new("ST1", "Ring road north"))
            .await
            .unwrap();
        let sensor = store
            .create_sensor(&NewSensor::new("S1", station.id).with_measurement_type("speed"))
            .await
            .unwrap();
        (store, station, sensor)
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_created_at() {
        let (store, _, sensor) = seeded().await;

        let first = store
            .insert(&NewMeasurement::new(sensor.id, Utc::now()).with_speed(50.5))
            .await
            .unwrap();
        let second = store
            .insert(&NewMeasurement::new(sensor.id, Utc::now()))
            .await
            .unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(second.created_at > first.created_at);
        assert_eq!(store.get(first.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let (store, _, sensor) = seeded().await;
        let batch = vec![
            NewMeasurement::new(sensor.id, Utc::now()),
            NewMeasurement::new(sensor.id + 100, Utc::now()),
        ];

        let err = store.insert_many(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingReference(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_codes_conflict() {
        let (store, station, _) = seeded().await;
        let err = store
            .create_sensor(&NewSensor::new("S1", station.id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_station_delete_cascades() {
        let (store, station, sensor) = seeded().await;
        store
            .insert(&NewMeasurement::new(sensor.id, Utc::now()))
            .await
            .unwrap();
        store
            .create_user_event(&NewUserEvent {
                station_id: Some(station.id),
                kind: "roadwork".to_string(),
                description: None,
                reported_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_station(station.id).await.unwrap());

        assert!(!store.sensor_exists(sensor.id).await.unwrap());
        assert_eq!(store.measurement_count(), 0);
        assert!(store.list_user_events().await.unwrap().is_empty());
        assert!(!store.delete_station(station.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_writes() {
        let (store, _, sensor) = seeded().await;
        store.set_unavailable(true);

        let err = store
            .insert(&NewMeasurement::new(sensor.id, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
