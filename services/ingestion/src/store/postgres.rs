use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, instrument};

use super::{CatalogStore, MeasurementStore, Result, SensorCatalog, StoreError};
use crate::config::DatabaseConfig;
use crate::model::{
    Measurement, NewMeasurement, NewSensor, NewStation, NewUserEvent, Sensor, Station, UserEvent,
};

const MEASUREMENT_COLUMNS: &str = "id, sensor_id, timestamp, speed, vehicle_count, created_at";

/// PostgreSQL-backed store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map constraint violations onto store errors
fn classify(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        match db.code().as_deref() {
            Some("23505") => return StoreError::Conflict(db.message().to_string()),
            Some("23503") => return StoreError::MissingReference(db.message().to_string()),
            _ => {}
        }
    }
    StoreError::Database(e)
}

fn insert_measurement_sql() -> String {
    format!(
        r#"
        INSERT INTO traffic_measurements (sensor_id, timestamp, speed, vehicle_count)
        VALUES ($1, $2, $3, $4)
        RETURNING {MEASUREMENT_COLUMNS}
        "#
    )
}

#[async_trait]
impl MeasurementStore for PgStore {
    #[instrument(skip(self, measurement), fields(sensor_id = measurement.sensor_id))]
    async fn insert(&self, measurement: &NewMeasurement) -> Result<Measurement> {
        let stored = sqlx::query_as::<_, Measurement>(&insert_measurement_sql())
            .bind(measurement.sensor_id)
            .bind(measurement.timestamp)
            .bind(measurement.speed)
            .bind(measurement.vehicle_count)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;

        debug!(id = stored.id, "Measurement inserted");
        Ok(stored)
    }

    #[instrument(skip(self, measurements), fields(count = measurements.len()))]
    async fn insert_many(&self, measurements: &[NewMeasurement]) -> Result<Vec<Measurement>> {
        let sql = insert_measurement_sql();
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(measurements.len());

        for measurement in measurements {
            let row = sqlx::query_as::<_, Measurement>(&sql)
                .bind(measurement.sensor_id)
                .bind(measurement.timestamp)
                .bind(measurement.speed)
                .bind(measurement.vehicle_count)
                .fetch_one(&mut *tx)
                .await
                .map_err(classify)?;
            stored.push(row);
        }

        tx.commit().await?;

        debug!(count = stored.len(), "Measurement batch committed");
        Ok(stored)
    }

    async fn get(&self, id: i64) -> Result<Option<Measurement>> {
        let measurement = sqlx::query_as::<_, Measurement>(&format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM traffic_measurements WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(measurement)
    }

    async fn list(&self) -> Result<Vec<Measurement>> {
        let measurements = sqlx::query_as::<_, Measurement>(&format!(
            "SELECT {MEASUREMENT_COLUMNS} FROM traffic_measurements ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(measurements)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SensorCatalog for PgStore {
    async fn sensor_exists(&self, sensor_id: i64) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM sensors WHERE id = $1)")
                .bind(sensor_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn create_station(&self, station: &NewStation) -> Result<Station> {
        sqlx::query_as::<_, Station>(
            r#"
            INSERT INTO stations (code, name, city, latitude, longitude)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, code, name, city, latitude, longitude
            "#,
        )
        .bind(&station.code)
        .bind(&station.name)
        .bind(&station.city)
        .bind(station.latitude)
        .bind(station.longitude)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn create_sensor(&self, sensor: &NewSensor) -> Result<Sensor> {
        sqlx::query_as::<_, Sensor>(
            r#"
            INSERT INTO sensors (code, station_id, measurement_type, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id, code, station_id, measurement_type, status
            "#,
        )
        .bind(&sensor.code)
        .bind(sensor.station_id)
        .bind(&sensor.measurement_type)
        .bind(&sensor.status)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn create_user_event(&self, event: &NewUserEvent) -> Result<UserEvent> {
        sqlx::query_as::<_, UserEvent>(
            r#"
            INSERT INTO user_events (station_id, kind, description, reported_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, station_id, kind, description, reported_at
            "#,
        )
        .bind(event.station_id)
        .bind(&event.kind)
        .bind(&event.description)
        .bind(event.reported_at)
        .fetch_one(&self.pool)
        .await
        .map_err(classify)
    }

    async fn get_sensor(&self, sensor_id: i64) -> Result<Option<Sensor>> {
        let sensor = sqlx::query_as::<_, Sensor>(
            "SELECT id, code, station_id, measurement_type, status FROM sensors WHERE id = $1",
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sensor)
    }

    async fn list_user_events(&self) -> Result<Vec<UserEvent>> {
        let events = sqlx::query_as::<_, UserEvent>(
            "SELECT id, station_id, kind, description, reported_at FROM user_events ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    #[instrument(skip(self))]
    async fn delete_sensor(&self, sensor_id: i64) -> Result<bool> {
        // traffic_measurements.sensor_id cascades
        let result = sqlx::query("DELETE FROM sensors WHERE id = $1")
            .bind(sensor_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_station(&self, station_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM stations WHERE id = $1")
            .bind(station_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_returns_all_columns() {
        let sql = insert_measurement_sql();
        assert!(sql.contains("RETURNING id, sensor_id, timestamp, speed, vehicle_count, created_at"));
    }

    #[test]
    fn test_plain_errors_are_not_reclassified() {
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            StoreError::Database(sqlx::Error::RowNotFound)
        ));
    }
}
