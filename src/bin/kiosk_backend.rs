//! kiosk-backend: control-plane process for a self-service vending kiosk.
//!
//! Wires the event bus (C1), SQLite repository (C2), cloud client (C3),
//! planogram synchronizer (C4), cart & reservation engine (C5) and
//! machine FSM (C6) together and runs them to completion, following the
//! teacher's `angzarr_standalone.rs` shape: tracing init, config load,
//! storage init, subsystem construction, then run forever.
//!
//! ## Configuration
//! Set via `KIOSK_CONFIG` (YAML file path, default `config.yaml`) or
//! environment overrides (`KIOSK_STORAGE_PATH`, `KIOSK_DEVICE_ID`,
//! `KIOSK_MEDIA_DIR`, `KIOSK_LOG_LEVEL`).

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiosk_core::bus::EventBus;
use kiosk_core::cart::CartEngine;
use kiosk_core::cloud::HttpCloudClient;
use kiosk_core::config::Config;
use kiosk_core::error::{is_fatal_at_startup, KioskError};
use kiosk_core::machine::MachineFsm;
use kiosk_core::planogram::PlanogramSynchronizer;
use kiosk_core::repository::{Repository, SqliteRepository};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load().map_err(KioskError::Config)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("KIOSK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting kiosk-backend");

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal startup error");
        if is_fatal_at_startup(&e) {
            std::process::exit(1);
        }
        return Err(Box::new(e));
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), KioskError> {
    if let Some(parent) = std::path::Path::new(&config.storage.path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::create_dir_all(&config.media.local_dir);

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(&config.storage.path)
        .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .connect_with(connect_options)
        .await
        .map_err(|e| kiosk_core::error::DbError::Broken(e.to_string()))?;
    let sqlite_repo = SqliteRepository::new(pool);
    sqlite_repo.migrate().await?;
    let repo: Arc<dyn Repository> = Arc::new(sqlite_repo);
    info!(path = %config.storage.path, "storage initialized");

    let cloud = Arc::new(HttpCloudClient::new(config.cloud.clone())?);

    let bus = EventBus::new();

    let planogram = PlanogramSynchronizer::new(bus.clone(), cloud.clone(), repo.clone(), &config);
    planogram.load_current_layout_from_repository().await?;
    planogram.subscribe().await;

    // `CartEngineHandle` is the direct-call API for update/clear/prolong/
    // reserve/dispense; no UI transport is wired up here (spec.md Non-goals).
    let (cart_engine, _cart_handle) = CartEngine::new(bus.clone(), cloud.clone(), repo.clone(), &config);
    cart_engine.recover_on_startup().await?;
    cart_engine.subscribe().await;
    cart_engine.clone().spawn_sweep(std::time::Duration::from_secs(config.timers.sweep_tick_secs));

    let machine = MachineFsm::new(bus.clone());
    machine.subscribe().await;

    bus.clone().spawn_dispatcher();

    info!("kiosk-backend ready");

    tokio::signal::ctrl_c().await.map_err(|e| kiosk_core::error::DbError::Broken(e.to_string()))?;
    info!("shutdown signal received");
    Ok(())
}
