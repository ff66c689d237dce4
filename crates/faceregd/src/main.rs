use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod recognition;

use config::{BusKind, Config};
use dbus_interface::{RegistryService, BUS_NAME, OBJECT_PATH};
use facereg_core::FaceRegistry;
use recognition::JsonLinesAnnotator;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries annotations; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("faceregd starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        storage = ?config.storage,
        data_dir = %config.data_dir.display(),
        threshold = config.match_threshold,
        strategy = ?config.match_strategy,
        dim = config.descriptor_dim,
        "configuration loaded"
    );

    let storage = config.open_storage().context("opening descriptor storage")?;
    let registry = FaceRegistry::open(storage, config.registry_config())
        .context("opening face registry")?;
    let engine = engine::spawn_engine(registry).context("starting registry engine")?;

    let (frame_tx, frame_rx) = recognition::frame_channel();

    let service = RegistryService::new(engine.clone(), frame_rx.clone());
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("publishing {BUS_NAME} on the {:?} bus", config.bus))?;
    tracing::info!(bus = ?config.bus, name = BUS_NAME, "D-Bus service registered");

    if config.feed_stdin {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        tokio::spawn(recognition::feed_json_lines(reader, frame_tx));
        tokio::spawn(recognition::run_recognition(
            engine,
            frame_rx,
            JsonLinesAnnotator::new(std::io::stdout()),
            Duration::from_millis(config.frame_interval_ms.max(1)),
        ));
    }

    tracing::info!("faceregd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceregd shutting down");

    Ok(())
}
