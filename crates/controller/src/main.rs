//! Insights controller - resource metadata outbox
//!
//! Runs the delivery pump, the retention housekeeper and the API key monitor
//! against a local outbox, and serves health and metrics over HTTP.

use anyhow::{Context, Result};
use controller_lib::{
    health::components, BackgroundService, Clock, FileApiKey, HealthRegistry, HouseKeeper,
    MetricsPusher, OutboxMetrics, ResourceStore, SecretMonitor, Shutdown, SystemClock,
};
use insights_controller::{api, config};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");
const DATABASE_FILE: &str = "outbox.db";

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::ControllerConfig::load()?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(fmt::layer().json())
        .init();

    info!(
        version = CONTROLLER_VERSION,
        cluster_name = %config.cluster_name,
        region = %config.region,
        "Starting insights-controller"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    for component in [
        components::STORE,
        components::PUSHER,
        components::HOUSEKEEPER,
        components::SECRETS,
    ] {
        health_registry.register(component).await;
    }

    let registry = Registry::new();
    let metrics = OutboxMetrics::new(&registry).context("failed to register metrics")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = match &config.database.storage_path {
        Some(dir) => ResourceStore::open(&dir.join(DATABASE_FILE), clock, metrics).await,
        None => {
            warn!("No storage path configured; pending records will not survive a restart");
            ResourceStore::open_in_memory(clock, metrics).await
        }
    }
    .context("failed to open resource store")?;

    let api_key = Arc::new(FileApiKey::load(&config.api_key_path).with_context(|| {
        format!(
            "failed to read API key from {}",
            config.api_key_path.display()
        )
    })?);

    let pusher = BackgroundService::new(
        MetricsPusher::new(
            store.clone(),
            api_key.clone(),
            config.pusher_config()?,
            health_registry.clone(),
        )
        .context("failed to build remote write client")?,
    );
    let housekeeper = BackgroundService::new(HouseKeeper::new(
        store.clone(),
        config.housekeeper_config(),
        health_registry.clone(),
    ));
    let secret_monitor = BackgroundService::new(SecretMonitor::new(
        api_key,
        config.secret_monitor_config(),
        health_registry.clone(),
    ));

    info!(
        host = pusher.job().config().endpoint.host_str().unwrap_or_default(),
        "Starting background services"
    );
    pusher.start().await;
    housekeeper.start().await;
    secret_monitor.start().await;

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), registry));
    let (api_trigger, api_shutdown) = Shutdown::new();
    let api_handle = tokio::spawn(api::serve(config.server.port, app_state, async move {
        api_shutdown.signalled().await
    }));

    // Mark controller as ready after initialization
    health_registry.set_ready(true).await;

    shutdown_signal().await?;
    info!("Shutting down");
    health_registry.set_ready(false).await;

    // the pusher's final flush needs the store, so it goes first
    pusher.shutdown().await;
    housekeeper.shutdown().await;
    secret_monitor.shutdown().await;

    api_trigger.signal();
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    if let Err(e) = store.close().await {
        error!(error = %e, "Failed to close resource store");
    }
    info!("Shutdown complete");

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
            _ = terminate.recv() => info!("SIGTERM received"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for SIGINT")
    }
}
