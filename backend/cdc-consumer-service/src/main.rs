use anyhow::{Context, Result};
use cdc_consumer_service::config::LogFormat;
use cdc_consumer_service::http::{HealthServer, HealthState};
use cdc_consumer_service::services::cdc::LogHandler;
use cdc_consumer_service::{CdcConsumer, CdcMetrics, Config, DispatchRegistry, HandlerScope, Lifecycle};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_consumer_service=debug".into());
    match config.service.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting cdc-consumer-service");

    let registry = prometheus::Registry::new();
    let metrics = CdcMetrics::new(&registry).context("Failed to register metrics")?;
    let lifecycle = Lifecycle::new();

    let mut handlers = DispatchRegistry::new();
    handlers.register(HandlerScope::AllKinds, Arc::new(LogHandler::new()));

    let http = HealthServer::start(
        config.service.http_port,
        HealthState {
            lifecycle: lifecycle.clone(),
            metrics: metrics.clone(),
            registry,
        },
    )
    .context("Failed to start HTTP server")?;

    let consumer = CdcConsumer::new(&config, Arc::new(handlers), metrics, lifecycle.clone())
        .context("Failed to create CDC consumer")?;

    consumer
        .connect()
        .await
        .context("Failed to connect to Kafka")?;

    let result = consumer.run(shutdown_signal()).await;

    // Leave the group and release the broker connection before exiting
    drop(consumer);
    http.stop().await;

    result.context("CDC consumer stopped with an error")?;

    info!(state = %lifecycle.current(), "cdc-consumer-service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
