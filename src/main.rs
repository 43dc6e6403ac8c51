mod admin;
mod command;
mod config;
mod coordinator;
mod error;
mod lifecycle;
mod registry;
mod topology;
mod transport;

use admin::CoordinatorDirectory;
use anyhow::Context;
use config::CoordinatorConfig;
use coordinator::Coordinator;
use std::path::PathBuf;
use std::sync::Arc;
use meshcoord_shared::Indication;
use registry::RegistryEvent;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable naming the config file when no argument is given
const CONFIG_ENV: &str = "MESHCOORD_CONFIG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from);
    let config = CoordinatorConfig::load(config_path.as_deref())
        .with_context(|| format!("failed to load config {:?}", config_path))?;

    info!("coordinator {} starting", config.instance_id);
    info!("  serial port: {} @ {}", config.serial.path, config.serial.baud_rate);

    let coordinator = Arc::new(Coordinator::launch(&config).await?);
    let directory = Arc::new(CoordinatorDirectory::new());
    tokio::spawn(log_network_activity(coordinator.clone()));
    directory.register(coordinator).await;

    let listener = TcpListener::bind(&config.admin.listen)
        .await
        .with_context(|| format!("failed to bind admin listener {}", config.admin.listen))?;

    tokio::select! {
        result = admin::serve(listener, directory.clone()) => {
            if let Err(e) = result {
                error!("admin server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    directory.shutdown_all().await;
    info!("coordinator stopped");
    Ok(())
}

/// Log device map changes and network indications until the instance goes away
async fn log_network_activity(coordinator: Arc<Coordinator>) {
    let mut devices = coordinator.subscribe_devices();
    let mut indications = coordinator.subscribe_indications();
    let id = coordinator.instance_id().to_string();
    drop(coordinator);

    loop {
        tokio::select! {
            event = devices.recv() => match event {
                Ok(RegistryEvent::DevicesChanged(map)) => {
                    info!("{}: {} devices known", id, map.len());
                }
                Err(RecvError::Lagged(n)) => warn!("{}: skipped {} device updates", id, n),
                Err(RecvError::Closed) => break,
            },
            indication = indications.recv() => match indication {
                Ok(Indication::DeviceIncoming { address }) => info!("{}: device {} joined", id, address),
                Ok(Indication::DeviceLeaving { address }) => info!("{}: device {} left", id, address),
                Ok(other) => debug!("{}: {:?}", id, other),
                Err(RecvError::Lagged(n)) => warn!("{}: skipped {} indications", id, n),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
