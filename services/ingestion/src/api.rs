use crate::auth::{bearer_token, AuthError, Authorizer, Principal};
use crate::broker::{BrokerState, DeliveryResult};
use crate::config::ApiConfig;
use crate::error::IngestError;
use crate::model::{BatchIngestRequest, BatchResult, Measurement};
use crate::pipeline::IngestionPipeline;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub code: String,
    /// Pipeline stage that failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Row that was stored even though its event was not published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement: Option<Measurement>,
}

impl ErrorResponse {
    fn new(detail: impl Into<String>, code: &str) -> Self {
        Self {
            detail: detail.into(),
            code: code.to_string(),
            stage: None,
            measurement: None,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Batch ingestion response
#[derive(Debug, Serialize)]
pub struct BatchIngestResponse {
    pub message: String,
    pub stored: usize,
    pub publish_failures: Vec<PublishFailureResponse>,
}

#[derive(Debug, Serialize)]
pub struct PublishFailureResponse {
    pub index: usize,
    pub sensor_id: i64,
    pub error: String,
}

impl From<BatchResult> for BatchIngestResponse {
    fn from(result: BatchResult) -> Self {
        Self {
            message: format!("Ingested {} measurements successfully.", result.stored),
            stored: result.stored,
            publish_failures: result
                .publish_failures
                .into_iter()
                .map(|f| PublishFailureResponse {
                    index: f.index,
                    sensor_id: f.sensor_id,
                    error: f.error.to_string(),
                })
                .collect(),
        }
    }
}

/// Republish response
#[derive(Debug, Serialize)]
pub struct DeliveryResponse {
    pub id: i64,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

fn ingest_error(e: IngestError) -> ApiError {
    let (status, code) = match &e {
        IngestError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
        IngestError::Referential { .. } => (StatusCode::NOT_FOUND, "SENSOR_NOT_FOUND"),
        IngestError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        IngestError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        IngestError::Publish { .. } => (StatusCode::BAD_GATEWAY, "PUBLISH_ERROR"),
        IngestError::IllegalState(_) => (StatusCode::SERVICE_UNAVAILABLE, "BROKER_UNAVAILABLE"),
    };

    if status.is_server_error() {
        error!(error = %e, stage = %e.stage(), "Request failed");
    }

    let detail = match &e {
        IngestError::NotFound(_) => "Measurement not found".to_string(),
        IngestError::Storage(_) => "Failed to store measurement".to_string(),
        other => other.to_string(),
    };

    let stage = e.stage().to_string();
    let measurement = match e {
        IngestError::Publish { measurement, .. } => measurement.map(|m| *m),
        _ => None,
    };

    (
        status,
        Json(ErrorResponse {
            detail,
            code: code.to_string(),
            stage: Some(stage),
            measurement,
        }),
    )
}

fn auth_error(e: AuthError) -> ApiError {
    let (status, code) = match &e {
        AuthError::MissingCredentials | AuthError::InvalidCredentials => {
            (StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
        }
        AuthError::Forbidden { .. } => (StatusCode::FORBIDDEN, "FORBIDDEN"),
    };
    warn!(error = %e, "Request rejected");
    (status, Json(ErrorResponse::new(e.to_string(), code)))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    state.authorizer.authenticate(token).map_err(auth_error)
}

fn authorize_write(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let principal = authenticate(state, headers)?;
    principal.require_write().map_err(auth_error)?;
    Ok(principal)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/data/real-time", post(ingest_real_time))
        .route("/data/batch", post(ingest_batch))
        .route("/data", get(list_measurements))
        .route("/data/", get(list_measurements))
        .route("/data/:measurement_id", get(get_measurement))
        .route("/data/:measurement_id/republish", post(republish_measurement))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "traffic-ingestion"
    }))
}

/// Ready once the broker session is open and the store answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker = state.pipeline.broker().state().await;
    let database = state.pipeline.store().health_check().await;

    match (broker, database) {
        (BrokerState::Ready, Ok(())) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "broker": broker.as_str(),
                "database": "connected"
            })),
        ),
        (broker, database) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "broker": broker.as_str(),
                "database": if database.is_ok() { "connected" } else { "disconnected" },
                "error": database.err().map(|e| e.to_string())
            })),
        ),
    }
}

/// Ingest one measurement
#[instrument(skip(state, headers, payload))]
async fn ingest_real_time(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<Measurement>, ApiError> {
    authorize_write(&state, &headers)?;

    let measurement = state
        .pipeline
        .ingest_json(payload)
        .await
        .map_err(ingest_error)?;

    Ok(Json(measurement))
}

/// Ingest a batch of measurements
#[instrument(skip(state, headers, payload))]
async fn ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<BatchIngestResponse>, ApiError> {
    authorize_write(&state, &headers)?;

    let request: BatchIngestRequest = serde_json::from_value(payload).map_err(|e| {
        ingest_error(IngestError::Validation(format!("malformed batch: {e}")))
    })?;

    let result = state
        .pipeline
        .ingest_batch(request.measurements)
        .await
        .map_err(ingest_error)?;

    Ok(Json(result.into()))
}

#[instrument(skip(state, headers))]
async fn list_measurements(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    authenticate(&state, &headers)?;
    let measurements = state.pipeline.list().await.map_err(ingest_error)?;
    Ok(Json(measurements))
}

#[instrument(skip(state, headers))]
async fn get_measurement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(measurement_id): Path<i64>,
) -> Result<Json<Measurement>, ApiError> {
    authenticate(&state, &headers)?;
    let measurement = state
        .pipeline
        .get(measurement_id)
        .await
        .map_err(ingest_error)?;
    Ok(Json(measurement))
}

/// Publish a stored measurement again
#[instrument(skip(state, headers))]
async fn republish_measurement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(measurement_id): Path<i64>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let principal = authorize_write(&state, &headers)?;

    let DeliveryResult {
        topic,
        partition,
        offset,
        ..
    } = state
        .pipeline
        .republish(measurement_id)
        .await
        .map_err(ingest_error)?;

    info!(id = measurement_id, principal = %principal.id, "Republish requested");

    Ok(Json(DeliveryResponse {
        id: measurement_id,
        topic,
        partition,
        offset,
    }))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ingestion API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
