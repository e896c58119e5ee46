use anyhow::{Context, Result};
use detect_gateway::{
    create_router, start_api_server, AppState, Detector, FileStore, GatewayConfig,
    InferenceClient, UploadIntake,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = GatewayConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.json_logs);

    info!(
        service = %config.service.name,
        "Starting detection gateway"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = Arc::new(
        FileStore::open(&config.storage.upload_dir)
            .await
            .context("Failed to initialize upload store")?,
    );

    let inference_client = Arc::new(
        InferenceClient::new(&config.inference, store.clone())
            .context("Failed to initialize inference client")?,
    );

    let state = AppState {
        service_name: config.service.name.clone(),
        store: store.clone(),
        intake: UploadIntake::new(store.clone()),
        detector: Detector::new(store, inference_client),
    };

    let router = create_router(state, &config.server, config.body_limit_bytes());

    start_api_server(router, &config.listen_addr(), shutdown_signal()).await?;

    info!("Detection gateway stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
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
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
