use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vigild::config::Config;
use vigild::dbus_interface::{VigilService, BUS_NAME, OBJECT_PATH};
use vigild::service::VerificationService;
use vigild::store::DescriptorStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        descriptor_dim = config.descriptor_dim,
        session_bus = config.session_bus,
        "vigild starting"
    );

    let store = DescriptorStore::open(&config.db_path, config.descriptor_dim)
        .await
        .with_context(|| format!("opening descriptor store at {}", config.db_path.display()))?;
    let service = Arc::new(VerificationService::new(store, config.service_settings()));
    let iface = VigilService::new(service, config.session_bus);

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on D-Bus"))?;

    tracing::info!(bus_name = BUS_NAME, "vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    Ok(())
}
