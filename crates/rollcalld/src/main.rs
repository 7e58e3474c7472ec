use anyhow::{Context, Result};
use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use rollcall_core::recognizer::ARCFACE_SPEC;
use rollcall_core::registry::IdentityRegistry;
use seal::EncodingCipher;
use std::sync::Arc;
use store::SqliteStore;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod seal;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        threshold = config.match_threshold,
        policy = %config.session_policy,
        "configuration loaded"
    );

    let cipher = config
        .encryption_key_path
        .as_deref()
        .map(EncodingCipher::from_key_file)
        .transpose()?;

    let store = SqliteStore::open(&config.db_path, config.store_timeout(), cipher.clone())
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let registry = Arc::new(IdentityRegistry::open(store, ARCFACE_SPEC)?);
    let gallery = registry.snapshot();
    tracing::info!(
        persons = gallery.person_count(),
        encodings = gallery.encoding_count(),
        "identity registry loaded"
    );

    let engine = engine::spawn_engine(config.clone(), cipher.clone(), Arc::clone(&registry))
        .context("starting recognition engine")?;

    let bus = config.bus;
    let service = AttendanceService {
        engine: engine.clone(),
        registry,
        config: Arc::new(config),
        cipher,
    };

    let builder = match bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {bus:?} bus"))?;

    tracing::info!(bus = ?bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    match engine.stop_session().await {
        Ok(summary) => tracing::info!(session = %summary.id, marked = summary.stats.marked, "session closed"),
        Err(engine::EngineError::NoSession) => {}
        Err(e) => tracing::warn!(error = %e, "failed to close session"),
    }

    Ok(())
}
