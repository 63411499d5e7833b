//! Livecourse - live course coordination server
//!
//! Runs the signaling listener and the session management listener over one
//! shared room registry, then waits for Ctrl-C to shut down cleanly.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use livecourse_core::{
    CourseStore, FfmpegRecorder, LocalMediaRouter, MemoryCourseStore, RecordingCoordinator,
    RoomRegistry, SessionLifecycle, SqliteCourseStore, StoreError,
};
use livecourse_net::{ControlServer, SignalingRelay, SignalingServer};

mod config;

use config::{Config, ConfigError, StorageBackend, StorageConfig};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] livecourse_net::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn open_store(config: &StorageConfig) -> Result<Arc<dyn CourseStore>, AppError> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory course store");
            Ok(Arc::new(MemoryCourseStore::new()))
        }
        StorageBackend::Sqlite => {
            let path = config.database_path()?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteCourseStore::open(&path)?;
            info!(path = %path.display(), schema = store.schema_version(), "Using SQLite course store");
            Ok(Arc::new(store))
        }
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let store = open_store(&config.storage)?;
    let timeout = config.lifecycle.dependency_timeout();

    let rooms = Arc::new(RoomRegistry::new(
        Arc::new(LocalMediaRouter::new(config.media.clone())),
        timeout,
    ));
    let recordings = Arc::new(RecordingCoordinator::new(
        Arc::new(FfmpegRecorder::new(config.recording.clone())),
        timeout,
    ));
    let lifecycle = Arc::new(SessionLifecycle::new(
        store,
        rooms.clone(),
        recordings,
        config.lifecycle.clone(),
    ));

    let relay = Arc::new(SignalingRelay::new(rooms));
    let signaling = SignalingServer::start(config.server.signaling_addr, relay).await?;
    let control = ControlServer::start(config.server.control_addr, lifecycle.clone()).await?;

    info!(
        signaling = %signaling.addr(),
        control = %control.addr(),
        recordings = %config.recording.directory.display(),
        "Livecourse ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    control.shutdown();
    signaling.shutdown();
    lifecycle.shutdown().await;
    let leftover = lifecycle.rooms().end_all().await;
    if leftover > 0 {
        info!(rooms = leftover, "Closed rooms without a course");
    }

    info!("Livecourse stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let path = config::config_path(std::env::args().skip(1), std::env::var(config::CONFIG_ENV).ok());
    let config = match &path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("livecourse: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log.filter);
    info!(config = ?path, "Starting Livecourse");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Livecourse failed");
            ExitCode::FAILURE
        }
    }
}
