use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use traffic_ingestion::api::{start_api_server, AppState};
use traffic_ingestion::{
    Config, IngestionPipeline, KafkaConnector, PgStore, PublishPolicy, SharedBroker,
    StaticTokenAuthorizer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        brokers = %config.kafka.bootstrap_servers,
        topic = %config.kafka.topics.measurements,
        "Starting traffic ingestion service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgStore::new(&config.database)
            .await
            .context("Failed to initialize measurement store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    // The broker session is open before the first request is accepted
    let broker = SharedBroker::start(
        Arc::new(KafkaConnector::new(config.kafka.clone())),
        PublishPolicy::from_config(&config.kafka),
    )
    .await
    .context("Failed to initialize broker client")?;

    let pipeline = IngestionPipeline::new(store.clone(), store.clone(), broker.client())
        .with_topic(config.kafka.topics.measurements.clone());

    let authorizer = StaticTokenAuthorizer::from_config(&config.auth);
    if authorizer.is_empty() {
        error!("No API tokens configured; every request will be rejected");
    } else {
        info!(tokens = authorizer.len(), "API tokens loaded");
    }

    let api_state = AppState {
        pipeline: Arc::new(pipeline),
        authorizer: Arc::new(authorizer),
    };

    info!("Ingestion service started successfully");

    let served = start_api_server(api_state, &config.api, shutdown_signal()).await;

    info!("Shutting down ingestion service");

    if let Err(e) = broker.shutdown().await {
        error!(error = %e, "Failed to flush broker client");
    }
    store.pool().close().await;

    info!("Ingestion service stopped");

    served
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
