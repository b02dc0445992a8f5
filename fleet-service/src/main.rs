use anyhow::{Context, Result};
use fleet_service::open_meteo::OpenMeteoProvider;
use fleet_service::optimizer::SurplusOptimizer;
use fleet_service::registry::default_registry;
use optimasol::driver::DriverRegistry;
use optimasol::persistence::{Persistence, SqlitePersistence};
use optimasol::{load_config, Dependencies, Fleet, FleetScheduler, SchedulerSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_service=info,optimasol=info".into()),
        )
        .init();

    info!("Fleet service starting...");

    let config_path =
        std::env::var("OPTIMASOL_CONFIG").unwrap_or_else(|_| "optimasol.toml".to_string());
    let mut config = load_config(&config_path)?;
    config.apply_env();
    config
        .validate()
        .context("Invalid service configuration")?;

    info!(
        config = %config_path,
        database = %config.database.path,
        mqtt_host = %config.mqtt.host,
        mqtt_port = config.mqtt.port,
        "Configuration loaded"
    );

    let registry = Arc::new(default_registry(&config.mqtt));
    let (persistence, fleet) = match open_fleet(&config.database.path, &registry).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(
                path = %config.database.path,
                fallback = %config.database.fallback_path,
                error = %e,
                "Primary database unavailable, using fallback"
            );
            open_fleet(&config.database.fallback_path, &registry)
                .await
                .context("Failed to load clients from fallback database")?
        }
    };

    let forecast = OpenMeteoProvider::new(Duration::from_secs(config.timeouts.forecast_secs))?;
    let deps = Dependencies {
        persistence,
        optimizer: Arc::new(SurplusOptimizer::new()),
        forecast: Arc::new(forecast),
        registry,
    };
    let scheduler = FleetScheduler::new(fleet, deps, SchedulerSettings::from_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    };

    tokio::join!(scheduler.run(shutdown_rx), signal);
    info!("Fleet service stopped");
    Ok(())
}

/// Opens the store at `path` and loads every client from it.
async fn open_fleet(
    path: &str,
    registry: &DriverRegistry,
) -> Result<(Arc<dyn Persistence>, Fleet)> {
    let store = SqlitePersistence::open(path)?;
    let (fleet, rejected) = Fleet::load(&store, registry)
        .await
        .with_context(|| format!("Failed to load clients from {}", path))?;
    for (id, reason) in &rejected {
        warn!(client_id = %id, error = %reason, "Client not loaded");
    }
    Ok((Arc::new(store), fleet))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl_c signal");
    }
}
