use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use traffic_ingestion::{
    scoped, BrokerClient, BrokerError, BrokerState, CatalogStore, IngestError, IngestionPipeline,
    MeasurementStore, MemoryStore, NewMeasurement, NewSensor, NewStation, NewUserEvent,
    PublishPolicy, RecordingBroker, SharedBroker, MEASUREMENTS_TOPIC,
};

struct Fixture {
    store: Arc<MemoryStore>,
    broker: RecordingBroker,
    shared: SharedBroker,
    pipeline: IngestionPipeline,
    station_id: i64,
    sensor_id: i64,
}

async fn fixture(policy: PublishPolicy) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let station = store
        .create_station(&NewStation::new("ST1", "Central avenue"))
        .await
        .unwrap();
    let sensor = store
        .create_sensor(&NewSensor::new("S1", station.id).with_measurement_type("speed"))
        .await
        .unwrap();

    let broker = RecordingBroker::new();
    let shared = SharedBroker::start(Arc::new(broker.clone()), policy)
        .await
        .unwrap();
    let pipeline = IngestionPipeline::new(store.clone(), store.clone(), shared.client());

    Fixture {
        store,
        broker,
        shared,
        pipeline,
        station_id: station.id,
        sensor_id: sensor.id,
    }
}

fn fail_fast() -> PublishPolicy {
    PublishPolicy::no_retry(Duration::from_millis(200))
}

#[tokio::test]
async fn single_measurement_is_stored_and_published() {
    let f = fixture(fail_fast()).await;
    let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    let stored = f
        .pipeline
        .ingest(NewMeasurement::new(f.sensor_id, timestamp).with_speed(50.5))
        .await
        .unwrap();

    assert_eq!(stored.speed, Some(50.5));
    assert_eq!(stored.timestamp, timestamp);
    assert_eq!(f.store.get(stored.id).await.unwrap(), Some(stored.clone()));

    let messages = f.broker.messages_for(MEASUREMENTS_TOPIC);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key.as_deref(), Some(f.sensor_id.to_string().as_str()));
    assert_eq!(messages[0].json()["speed"], 50.5);
    assert_eq!(messages[0].json()["sensor_id"], f.sensor_id);
}

#[tokio::test]
async fn batch_keeps_storing_when_one_publish_fails() {
    let f = fixture(fail_fast()).await;
    f.broker.fail_attempt(2);

    let batch: Vec<_> = (0..5)
        .map(|i| NewMeasurement::new(f.sensor_id, Utc::now()).with_vehicle_count(i * 10))
        .collect();

    let result = f.pipeline.ingest_batch(batch).await.unwrap();

    assert_eq!(result.stored, 5);
    assert_eq!(result.failed_indices(), vec![2]);
    assert_eq!(f.store.measurement_count(), 5);

    let counts: Vec<_> = f
        .broker
        .messages()
        .iter()
        .map(|m| m.json()["vehicle_count"].as_i64().unwrap())
        .collect();
    assert_eq!(counts, vec![0, 10, 30, 40]);
}

#[tokio::test]
async fn transient_publish_failure_is_retried() {
    let policy = PublishPolicy {
        retries: 2,
        retry_backoff: Duration::from_millis(1),
        ..fail_fast()
    };
    let f = fixture(policy).await;
    f.broker.fail_attempt(0);

    f.pipeline
        .ingest(NewMeasurement::new(f.sensor_id, Utc::now()))
        .await
        .unwrap();

    assert_eq!(f.broker.attempts(), 2);
    assert_eq!(f.broker.messages().len(), 1);
}

#[tokio::test]
async fn publish_failure_keeps_the_stored_row() {
    let f = fixture(fail_fast()).await;
    f.broker.fail_key(f.sensor_id.to_string());

    let err = f
        .pipeline
        .ingest(NewMeasurement::new(f.sensor_id, Utc::now()).with_speed(12.0))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Publish { .. }));
    assert!(err.is_stored());
    let row = err.stored_measurement().unwrap();
    assert_eq!(f.store.get(row.id).await.unwrap().as_ref(), Some(row));
}

#[tokio::test]
async fn unknown_sensor_leaves_no_trace() {
    let f = fixture(fail_fast()).await;

    let err = f
        .pipeline
        .ingest(NewMeasurement::new(f.sensor_id + 1000, Utc::now()))
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Referential { index: None, .. }));
    assert_eq!(f.store.measurement_count(), 0);
    assert_eq!(f.broker.attempts(), 0);
}

#[tokio::test]
async fn events_for_one_sensor_keep_submission_order() {
    let f = fixture(fail_fast()).await;

    for count in 0..20 {
        f.pipeline
            .ingest(NewMeasurement::new(f.sensor_id, Utc::now()).with_vehicle_count(count))
            .await
            .unwrap();
    }

    let counts: Vec<_> = f
        .broker
        .messages()
        .iter()
        .map(|m| m.json()["vehicle_count"].as_i64().unwrap())
        .collect();
    assert_eq!(counts, (0..20).collect::<Vec<i64>>());
}

#[tokio::test]
async fn concurrent_requests_share_one_session() {
    let f = fixture(fail_fast()).await;
    f.broker.set_latency(Duration::from_millis(5));
    let pipeline = Arc::new(f.pipeline);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pipeline = pipeline.clone();
            let sensor_id = f.sensor_id;
            tokio::spawn(async move {
                pipeline
                    .ingest(NewMeasurement::new(sensor_id, Utc::now()).with_vehicle_count(i))
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(f.store.measurement_count(), 16);
    assert_eq!(f.broker.messages().len(), 16);
    assert_eq!(f.broker.connect_count(), 1);
}

#[tokio::test]
async fn publishing_after_shutdown_is_illegal() {
    let f = fixture(fail_fast()).await;
    let client = f.shared.client();
    f.shared.shutdown().await.unwrap();

    assert_eq!(client.state().await, BrokerState::Closed);
    assert_eq!(f.broker.flush_count(), 1);

    let err = client
        .publish(MEASUREMENTS_TOPIC, Some("1"), &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.is_illegal_state());
    assert!(client.initialize().await.is_err());
}

#[tokio::test]
async fn deleting_a_station_cascades_to_measurements() {
    let f = fixture(fail_fast()).await;
    f.pipeline
        .ingest(NewMeasurement::new(f.sensor_id, Utc::now()))
        .await
        .unwrap();
    f.store
        .create_user_event(&NewUserEvent {
            station_id: Some(f.station_id),
            kind: "accident".to_string(),
            description: Some("lane two blocked".to_string()),
            reported_at: Utc::now(),
        })
        .await
        .unwrap();

    assert!(f.store.delete_station(f.station_id).await.unwrap());

    assert!(f.pipeline.list().await.unwrap().is_empty());
    assert!(f.store.get_sensor(f.sensor_id).await.unwrap().is_none());
    assert!(f.store.list_user_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn scoped_client_serves_one_unit_of_work() {
    let store = Arc::new(MemoryStore::new());
    let station = store
        .create_station(&NewStation::new("ST9", "Ring road"))
        .await
        .unwrap();
    let sensor = store
        .create_sensor(&NewSensor::new("S9", station.id))
        .await
        .unwrap();
    let broker = RecordingBroker::new();

    let stored = scoped(Arc::new(broker.clone()), fail_fast(), |client: Arc<BrokerClient>| {
        let pipeline = IngestionPipeline::new(store.clone(), store.clone(), client);
        async move {
            pipeline
                .ingest(NewMeasurement::new(sensor.id, Utc::now()))
                .await
        }
    })
    .await
    .unwrap();

    assert_eq!(stored.sensor_id, sensor.id);
    assert_eq!(broker.messages().len(), 1);
    assert_eq!(broker.flush_count(), 1);
}

#[tokio::test]
async fn scoped_reports_connect_failures_as_errors() {
    struct Unreachable;

    #[async_trait::async_trait]
    impl traffic_ingestion::Connector for Unreachable {
        async fn connect(
            &self,
        ) -> Result<Arc<dyn traffic_ingestion::ProducerBackend>, BrokerError> {
            Err(BrokerError::Creation("no brokers reachable".to_string()))
        }
    }

    let result: Result<(), BrokerError> =
        scoped(Arc::new(Unreachable), fail_fast(), |_client| async { Ok(()) }).await;

    assert!(matches!(result, Err(BrokerError::Creation(_))));
}
