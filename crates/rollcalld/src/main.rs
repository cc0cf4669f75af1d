use anyhow::{Context, Result};
use rollcall_core::{GalleryLoader, OnnxFaceEncoder};
use rollcall_hw::SystemOpener;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod model;
mod orchestrator;
mod reconcile;
mod scheduler;
mod session;
mod store;
#[cfg(test)]
mod testing;
mod window;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use orchestrator::Orchestrator;
use scheduler::{Scheduler, SchedulerSettings};
use session::SessionSettings;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        faces = %config.face_dir.display(),
        strategy = ?config.match_strategy,
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let encoder = OnnxFaceEncoder::load(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    tracing::info!("face models loaded");

    let engine = engine::spawn_engine(
        Box::new(encoder),
        Box::new(SystemOpener::new(config.source_settings())),
        GalleryLoader::new(&config.face_dir, &config.reference_extension),
    )?;

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        engine,
        SessionSettings::from_config(&config),
        config.record_absent_when_empty,
    ));

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&orchestrator),
        SchedulerSettings::from_config(&config),
    )
    .start();

    let shutdown = CancellationToken::new();
    let service = AttendanceService {
        orchestrator,
        store,
        shutdown: shutdown.clone(),
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the D-Bus"))?;

    tracing::info!(bus = BUS_NAME, session_bus = config.session_bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    shutdown.cancel();
    scheduler.shutdown().await;

    Ok(())
}
