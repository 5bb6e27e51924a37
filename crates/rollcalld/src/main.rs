use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{Bus, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        samples = config.stabilize_samples,
        bus = ?config.bus,
        "configuration loaded"
    );

    let (engine, engine_thread) = engine::spawn_engine(
        config.service_config(),
        &config.embedding_model_path(),
        &config.detector_model_path(),
        config.detection_confidence,
        &config.db_path,
    )?;

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine))?
        .build()
        .await?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // Releasing the interface drops the last engine handle, which ends the engine loop.
    conn.object_server()
        .remove::<AttendanceService, _>(OBJECT_PATH)
        .await?;
    drop(conn);

    let state = tokio::task::spawn_blocking(move || engine_thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("engine thread panicked"))?;
    tracing::info!(%state, "engine stopped");

    Ok(())
}
